use common::error::Kind;

/// Maps 1:1 onto the shared error-kind taxonomy (spec §7) while carrying
/// just enough context to render the correct SMTP reply without leaking
/// internals to the client. Each variant other than `Io` carries the exact
/// reply code so `reply()` can be the single place that formats the wire
/// line - the session loop constructs one of these at every failure point
/// instead of hand-writing the line itself.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{1}")]
    Syntax(u16, String),
    #[error("{1}")]
    WrongState(u16, String),
    #[error("{1}")]
    Auth(u16, String),
    #[error("{1}")]
    Policy(u16, String),
    #[error("temporary storage failure")]
    Storage,
}

impl SessionError {
    pub fn kind(&self) -> Kind {
        match self {
            SessionError::Io(_) => Kind::TransientNetwork,
            SessionError::Syntax(..) => Kind::ProtocolSyntax,
            SessionError::WrongState(..) => Kind::ProtocolSemantic,
            SessionError::Auth(..) => Kind::AuthFailure,
            SessionError::Policy(..) => Kind::PolicyReject,
            SessionError::Storage => Kind::StorageError,
        }
    }

    /// `code message` as written on the wire, or `None` for errors that close
    /// the socket without a reply (transient network failure).
    pub fn reply(&self) -> Option<String> {
        match self {
            SessionError::Io(_) => None,
            SessionError::Syntax(code, msg)
            | SessionError::WrongState(code, msg)
            | SessionError::Auth(code, msg)
            | SessionError::Policy(code, msg) => Some(format!("{code} {msg}")),
            SessionError::Storage => Some("451 temporary local problem, please try again".to_string()),
        }
    }
}
