//! The Relay Policy (spec §4.9). Applies only in MX mode, at the `RCPT TO`
//! gate; the `MAIL FROM` side stays permissive because external MTAs
//! deliver on behalf of arbitrary senders.

use std::sync::Arc;

use common::config::ServerConfig;
use store::MessageStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    RelayDenied,
    NoSuchUser,
}

pub async fn evaluate(config: &ServerConfig, store: &Arc<dyn MessageStore>, recipient: &str) -> Verdict {
    let Some((_, domain)) = recipient.rsplit_once('@') else {
        return Verdict::RelayDenied;
    };

    if !config.is_hosted_domain(domain) {
        return Verdict::RelayDenied;
    }

    if config.smtp.mx.validate_recipients {
        match store.find_user_by_address(recipient, false).await {
            Ok(Some(_)) => Verdict::Accept,
            _ => Verdict::NoSuchUser,
        }
    } else {
        Verdict::Accept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::memory::MemoryStore;

    fn config_with_domains(domains: &[&str], validate: bool) -> ServerConfig {
        let toml = format!(
            r#"
            server_name = "mail.example.com"
            database_connection = "postgres://localhost/mail"

            [tls]
            certificate_path = "/etc/mail/cert.pem"

            [smtp]
            port = 587
            secure_port = 465

            [smtp.mx]
            enabled = true
            hosted_domains = [{}]
            validate_recipients = {validate}

            [pop3]
            port = 110
            secure_port = 995

            [imap]
            port = 143
            secure_port = 993
            "#,
            domains
                .iter()
                .map(|d| format!("\"{d}\""))
                .collect::<Vec<_>>()
                .join(", ")
        );
        toml::from_str(&toml).unwrap()
    }

    #[tokio::test]
    async fn denies_non_hosted_domain() {
        let config = config_with_domains(&["example.com"], false);
        let store: Arc<dyn MessageStore> = Arc::new(MemoryStore::new());
        let verdict = evaluate(&config, &store, "bob@other.com").await;
        assert_eq!(verdict, Verdict::RelayDenied);
    }

    #[tokio::test]
    async fn accepts_hosted_domain_without_validation() {
        let config = config_with_domains(&["example.com"], false);
        let store: Arc<dyn MessageStore> = Arc::new(MemoryStore::new());
        let verdict = evaluate(&config, &store, "nobody@example.com").await;
        assert_eq!(verdict, Verdict::Accept);
    }

    #[tokio::test]
    async fn rejects_unknown_user_when_validating() {
        let config = config_with_domains(&["example.com"], true);
        let store: Arc<dyn MessageStore> = Arc::new(MemoryStore::new());
        let verdict = evaluate(&config, &store, "nobody@example.com").await;
        assert_eq!(verdict, Verdict::NoSuchUser);
    }
}
