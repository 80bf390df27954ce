//! Typed configuration surface (spec §1d, §6). Unlike the reference
//! implementation's dynamically-typed `utils::config::Config` property bag -
//! built for a runtime-reconfigurable admin surface this repository doesn't
//! have - configuration here is a fixed `serde`-deserializable struct tree
//! loaded once from a single TOML file at startup.

use std::{path::Path, time::Duration};

use serde::Deserialize;

mod duration_secs;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub server_name: String,
    pub database_connection: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub tls: TlsSection,
    #[serde(default)]
    pub limits: LimitsSection,
    pub smtp: SmtpSection,
    pub pop3: ProtocolSection,
    pub imap: ProtocolSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsSection {
    pub certificate_path: String,
    #[serde(default)]
    pub certificate_password: Option<String>,
    #[serde(default)]
    pub check_certificate_revocation: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    #[serde(default = "default_max_attachment_size")]
    pub max_attachment_size_bytes: u64,
    #[serde(default = "default_max_message_size")]
    pub max_message_size_bytes: u64,
    #[serde(with = "duration_secs", default = "default_session_timeout")]
    pub session_timeout: Duration,
    #[serde(with = "duration_secs", default = "default_command_timeout")]
    pub command_timeout: Duration,
    /// Per source-authenticated-user cap (spec §4.5), enforced by the
    /// connection supervisor once a session authenticates.
    #[serde(default = "default_max_connections_per_user")]
    pub max_connections_per_user: u32,
    /// Total connections across all listeners for one protocol (spec §4.5).
    #[serde(default = "default_max_total_connections")]
    pub max_total_connections: u32,
    /// Per source-IP cap (spec §4.5), enforced at accept time.
    #[serde(default = "default_max_connections_per_ip")]
    pub max_connections_per_ip: u32,
    #[serde(default = "default_max_messages_per_session")]
    pub max_messages_per_session: u32,
}

impl Default for LimitsSection {
    fn default() -> Self {
        LimitsSection {
            max_attachment_size_bytes: default_max_attachment_size(),
            max_message_size_bytes: default_max_message_size(),
            session_timeout: default_session_timeout(),
            command_timeout: default_command_timeout(),
            max_connections_per_user: default_max_connections_per_user(),
            max_total_connections: default_max_total_connections(),
            max_connections_per_ip: default_max_connections_per_ip(),
            max_messages_per_session: default_max_messages_per_session(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolSection {
    pub port: u16,
    pub secure_port: u16,
    #[serde(default = "default_true")]
    pub require_authentication: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpSection {
    pub port: u16,
    pub secure_port: u16,
    #[serde(default = "default_true")]
    pub require_authentication: bool,
    #[serde(default)]
    pub mx: MxSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MxSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub hosted_domains: Vec<String>,
    #[serde(default = "default_true")]
    pub validate_recipients: bool,
    #[serde(default = "default_mx_port")]
    pub port: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("MX mode is enabled with no hosted domains configured - this would accept mail for any domain (open relay)")]
    OpenRelayMisconfiguration,
    #[error("implicit-TLS port {0} is configured but no certificate is available")]
    MissingCertificateForImplicitTls(u16),
}

impl ServerConfig {
    /// Loads and validates configuration. Validation failures here are the
    /// only `Fatal (startup only)` errors this repository raises (spec §7);
    /// by design `load` never partially succeeds.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| Error::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: ServerConfig = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.smtp.mx.enabled && self.smtp.mx.hosted_domains.is_empty() {
            return Err(Error::OpenRelayMisconfiguration);
        }
        Ok(())
    }

    /// True if `domain` is one of the hosted MX domains this server accepts mail for.
    pub fn is_hosted_domain(&self, domain: &str) -> bool {
        let needle = domain.to_ascii_lowercase();
        self.smtp
            .mx
            .hosted_domains
            .iter()
            .any(|d| d.to_ascii_lowercase() == needle)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_attachment_size() -> u64 {
    25 * 1024 * 1024
}

fn default_max_message_size() -> u64 {
    50 * 1024 * 1024
}

fn default_session_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_max_connections_per_user() -> u32 {
    10
}

fn default_max_total_connections() -> u32 {
    1000
}

fn default_max_connections_per_ip() -> u32 {
    20
}

fn default_max_messages_per_session() -> u32 {
    1000
}

fn default_mx_port() -> u16 {
    25
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mx_enabled_without_hosted_domains() {
        let toml = r#"
            server_name = "mail.example.com"
            database_connection = "postgres://localhost/mail"

            [tls]
            certificate_path = "/etc/mail/cert.pem"

            [smtp]
            port = 587
            secure_port = 465

            [smtp.mx]
            enabled = true

            [pop3]
            port = 110
            secure_port = 995

            [imap]
            port = 143
            secure_port = 993
        "#;
        let config: ServerConfig = toml::from_str(toml).unwrap();
        assert!(matches!(
            config.validate(),
            Err(Error::OpenRelayMisconfiguration)
        ));
    }

    #[test]
    fn accepts_mx_enabled_with_hosted_domains() {
        let toml = r#"
            server_name = "mail.example.com"
            database_connection = "postgres://localhost/mail"

            [tls]
            certificate_path = "/etc/mail/cert.pem"

            [smtp]
            port = 587
            secure_port = 465

            [smtp.mx]
            enabled = true
            hosted_domains = ["example.com"]

            [pop3]
            port = 110
            secure_port = 995

            [imap]
            port = 143
            secure_port = 993
        "#;
        let config: ServerConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());
        assert!(config.is_hosted_domain("Example.COM"));
        assert!(!config.is_hosted_domain("other.com"));
    }
}
