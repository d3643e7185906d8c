use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::warn;

use crate::config::NotifyConfig;

/// Told about successful proxy toggles. Best-effort: delivery failures are
/// logged and swallowed, never fed back into the check loop.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn toggled(&self, enabled: bool, resolved_ips: &str);
}

/// Email notifier over SMTP.
pub struct MailNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: String,
    to: String,
    hostname: String,
}

impl MailNotifier {
    pub fn new(config: &NotifyConfig, hostname: &str) -> Result<Self> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_relay)
            .context("invalid SMTP relay")?
            .port(config.smtp_port);

        if !config.smtp_username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.smtp_username.clone(),
                config.smtp_password.clone(),
            ));
        }

        Ok(Self {
            transport: builder.build(),
            from: config.from.clone(),
            to: config.to.clone(),
            hostname: hostname.to_string(),
        })
    }
}

#[async_trait]
impl Notifier for MailNotifier {
    async fn toggled(&self, enabled: bool, resolved_ips: &str) {
        let subject = if enabled {
            format!("[{}] Proxy re-enabled", self.hostname)
        } else {
            format!("[{}] Proxy disabled - possible block detected", self.hostname)
        };
        let body = if enabled {
            format!(
                "The reverse proxy for {} has been re-enabled automatically: \
                 its address no longer appears on the blocklist.\n",
                self.hostname
            )
        } else {
            format!(
                "The reverse proxy for {} has been disabled automatically: \
                 the address {} appears on the blocklist.\n",
                self.hostname, resolved_ips
            )
        };

        let email = match build_message(&self.from, &self.to, &subject, body) {
            Ok(email) => email,
            Err(e) => {
                warn!("could not build notification email: {}", e);
                return;
            }
        };

        if let Err(e) = self.transport.send(email).await {
            warn!("notification email failed: {}", e);
        }
    }
}

fn build_message(from: &str, to: &str, subject: &str, body: String) -> Result<Message> {
    Message::builder()
        .from(from.parse().context("invalid from address")?)
        .to(to.parse().context("invalid to address")?)
        .subject(subject)
        .header(ContentType::TEXT_PLAIN)
        .body(body)
        .context("failed to build email")
}
