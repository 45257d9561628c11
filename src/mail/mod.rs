//! Outbound mail.
//!
//! The auth flow only ever hands a [`MailMessage`] to a [`Mailer`] from a
//! spawned task; delivery failures are logged there and never reach the
//! request that triggered them.

mod http;

pub use http::HttpMailer;

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};
use url::Url;

use crate::config::{MailConfig, MailProvider};
use crate::error::MailError;
use crate::{AppError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MailMessage {
    pub to: String,
    pub subject: String,
    pub text: String,
}

impl MailMessage {
    pub fn confirmation_code(to: &str, code: &str, ttl_minutes: i64) -> Self {
        Self {
            to: to.to_string(),
            subject: "Confirm your email".to_string(),
            text: format!(
                "Your confirmation code is {code}.\n\nIt expires in {ttl_minutes} minutes. \
                 If you did not create an account, ignore this message."
            ),
        }
    }

    pub fn confirmation_link(to: &str, link: &Url) -> Self {
        Self {
            to: to.to_string(),
            subject: "Confirm your email".to_string(),
            text: format!(
                "Follow this link to confirm your email:\n\n{link}\n\n\
                 If you did not create an account, ignore this message."
            ),
        }
    }
}

/// Builds `{frontend_url}?token=...`, keeping any query already present.
pub fn confirmation_url(frontend_url: &str, token: &str) -> Result<Url> {
    let mut url = Url::parse(frontend_url)
        .map_err(|e| AppError::ConfigError(format!("Invalid frontend url: {}", e)))?;
    url.query_pairs_mut().append_pair("token", token);
    Ok(url)
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &MailMessage) -> std::result::Result<(), MailError>;
}

/// Writes messages to the log instead of delivering them.
#[derive(Debug, Clone, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: &MailMessage) -> std::result::Result<(), MailError> {
        info!(
            to = %message.to,
            subject = %message.subject,
            body = %message.text,
            "mail delivery stub"
        );
        Ok(())
    }
}

pub fn mailer_from_config(config: &MailConfig) -> Result<Arc<dyn Mailer>> {
    match config.provider {
        MailProvider::Log => Ok(Arc::new(LogMailer)),
        MailProvider::Http => {
            let api_url = config.api_url.as_deref().ok_or_else(|| {
                AppError::ConfigError("mail.api_url is required for the http provider".into())
            })?;
            Ok(Arc::new(HttpMailer::new(
                api_url,
                config.api_key.clone(),
                format!("{} <{}>", config.from_name, config.from_address),
            )?))
        }
    }
}

/// Fire-and-forget delivery.
pub fn dispatch(mailer: Arc<dyn Mailer>, message: MailMessage) {
    tokio::spawn(async move {
        if let Err(e) = mailer.send(&message).await {
            error!(to = %message.to, error = %e, "mail delivery failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirmation_url_appends_token() {
        let url = confirmation_url("https://app.example.com/confirm", "abc.def.ghi").unwrap();
        assert_eq!(url.as_str(), "https://app.example.com/confirm?token=abc.def.ghi");

        let url = confirmation_url("https://app.example.com/confirm?lang=en", "t").unwrap();
        assert_eq!(url.as_str(), "https://app.example.com/confirm?lang=en&token=t");

        assert!(matches!(
            confirmation_url("not a url", "t"),
            Err(AppError::ConfigError(_))
        ));
    }

    #[test]
    fn test_code_message_mentions_code() {
        let message = MailMessage::confirmation_code("a@mail.com", "123456", 10);
        assert_eq!(message.to, "a@mail.com");
        assert!(message.text.contains("123456"));
        assert!(message.text.contains("10 minutes"));
    }

    #[test]
    fn test_http_provider_requires_url() {
        let config = MailConfig {
            provider: MailProvider::Http,
            api_url: None,
            api_key: None,
            from_address: "no-reply@example.com".into(),
            from_name: "Support Team".into(),
        };
        assert!(matches!(mailer_from_config(&config), Err(AppError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_dispatch_swallows_failures() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let mut tx = Some(tx);
        let mut mailer = MockMailer::new();
        mailer.expect_send().times(1).returning(move |_| {
            if let Some(tx) = tx.take() {
                let _ = tx.send(());
            }
            Err(MailError::Rejected(503))
        });

        dispatch(Arc::new(mailer), MailMessage::confirmation_code("a@mail.com", "1", 1));

        tokio::time::timeout(std::time::Duration::from_secs(1), rx)
            .await
            .expect("mailer was never called")
            .unwrap();
    }
}
