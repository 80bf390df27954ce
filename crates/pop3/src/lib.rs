pub mod error;
pub mod session;
pub mod snapshot;

pub use error::SessionError;
pub use session::{Pop3EngineConfig, Pop3SessionHandler};
