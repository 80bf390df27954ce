use common::error::Kind;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Syntax(String),
    #[error("{0}")]
    WrongState(String),
    #[error("authentication failed")]
    Auth,
    #[error("temporary storage failure")]
    Storage,
}

impl SessionError {
    pub fn kind(&self) -> Kind {
        match self {
            SessionError::Io(_) => Kind::TransientNetwork,
            SessionError::Syntax(_) => Kind::ProtocolSyntax,
            SessionError::WrongState(_) => Kind::ProtocolSemantic,
            SessionError::Auth => Kind::AuthFailure,
            SessionError::Storage => Kind::StorageError,
        }
    }

    /// `-ERR message` as written on the wire, or `None` for errors that close
    /// the socket without a reply (transient network failure).
    pub fn reply(&self) -> Option<String> {
        match self {
            SessionError::Io(_) => None,
            SessionError::Syntax(msg) => Some(format!("-ERR {msg}")),
            SessionError::WrongState(msg) => Some(format!("-ERR {msg}")),
            SessionError::Auth => Some("-ERR authentication failed".to_string()),
            SessionError::Storage => Some("-ERR local error in processing".to_string()),
        }
    }
}
