use common::error::Kind;

/// IMAP replies are tagged (`<tag> NO/BAD reason`) rather than carrying a
/// fixed status code, so the session loop writes each protocol failure
/// inline via `write_tagged` instead of through a context-free `reply()`.
/// This taxonomy only covers the two failure classes the session actually
/// raises outside of that tagged-reply path.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),
    #[error("temporary storage failure")]
    Storage,
}

impl SessionError {
    pub fn kind(&self) -> Kind {
        match self {
            SessionError::Io(_) => Kind::TransientNetwork,
            SessionError::Storage => Kind::StorageError,
        }
    }
}
