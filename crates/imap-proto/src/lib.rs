//! IMAP4rev2 command grammar used by the `imap` session engine: tagged
//! command parsing, message-set syntax, and the small vocabulary of `FETCH`
//! items, `STORE` actions and `SEARCH` keys this repository's IMAP core
//! supports.

pub mod command;
pub mod error;
pub mod message_set;

pub use command::{parse_command, BodySection, Command, FetchItem, SearchKey, StoreAction};
pub use error::{Error, Result};
pub use message_set::MessageSet;
