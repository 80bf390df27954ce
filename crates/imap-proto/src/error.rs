#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("malformed command")]
    Syntax,
    #[error("missing or malformed tag")]
    MissingTag,
    #[error("unknown command {0}")]
    UnknownCommand(String),
    #[error("malformed message set")]
    MalformedMessageSet,
}

pub type Result<T> = std::result::Result<T, Error>;
