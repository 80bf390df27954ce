pub mod error;
pub mod relay;
pub mod session;
pub mod state;

pub use error::SessionError;
pub use session::{SmtpEngineConfig, SmtpSessionHandler};
pub use state::{AuthState, Envelope, Mode, Stage};
