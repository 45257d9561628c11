use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{MailMessage, Mailer};
use crate::error::MailError;
use crate::{AppError, Result};

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    text: &'a str,
}

/// Delivers through a transactional-mail HTTP API: one JSON POST per message,
/// authenticated with a bearer API key.
#[derive(Debug, Clone)]
pub struct HttpMailer {
    client: reqwest::Client,
    endpoint: Url,
    api_key: Option<String>,
    from: String,
}

impl HttpMailer {
    pub fn new(endpoint: &str, api_key: Option<String>, from: String) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| AppError::ConfigError(format!("Invalid mail api url: {}", e)))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AppError::InternalError(e.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            api_key,
            from,
        })
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, message: &MailMessage) -> std::result::Result<(), MailError> {
        let body = SendRequest {
            from: &self.from,
            to: &message.to,
            subject: &message.subject,
            text: &message.text,
        };

        let mut request = self.client.post(self.endpoint.clone()).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(MailError::Rejected(status.as_u16()));
        }

        debug!(to = %message.to, "mail accepted by provider");
        Ok(())
    }
}
