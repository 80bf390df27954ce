//! The error taxonomy every protocol engine maps its own `SessionError` onto
//! (spec §7). This enum exists only to drive two decisions uniformly across
//! SMTP/POP3/IMAP: what gets logged at what level, and whether the session
//! continues or the socket closes. It carries no data of its own - each
//! protocol crate's `SessionError` still owns the context needed to render
//! the correct wire response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Broken pipe, timeout, peer reset. Log at debug, close session, don't surface.
    TransientNetwork,
    /// Malformed command/literal. Reply with the protocol's "bad syntax" code, continue.
    ProtocolSyntax,
    /// Well-formed command in the wrong state, or against a missing object. Reply "no", continue.
    ProtocolSemantic,
    /// Any verifier negative. Reply with the generic "authentication failed" code.
    AuthFailure,
    /// MX recipient outside hosted domains, over-size message, too many recipients.
    PolicyReject,
    /// Store call failed. Reply with a temporary-failure code so clients retry.
    StorageError,
}

impl Kind {
    /// Whether a session should stay open after an error of this kind.
    pub fn continues_session(self) -> bool {
        !matches!(self, Kind::TransientNetwork)
    }

    pub fn log_level(self) -> tracing::Level {
        match self {
            Kind::TransientNetwork => tracing::Level::DEBUG,
            Kind::ProtocolSyntax | Kind::ProtocolSemantic | Kind::AuthFailure | Kind::PolicyReject => {
                tracing::Level::WARN
            }
            Kind::StorageError => tracing::Level::ERROR,
        }
    }
}
