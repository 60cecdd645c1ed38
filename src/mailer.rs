//! Mail transport adapter.
//!
//! The dispatch worker only depends on [`Mailer`]. Every failure a transport
//! can report is a [`TransportError`]; the worker records those against the
//! recipient instead of failing the task.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use thiserror::Error;
use tracing::info;

use crate::config::{Mail, Smtp, TlsMode, TransportKind};
use crate::render::RenderedMessage;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid email address: {0}")]
    InvalidAddress(String),
    #[error("failed to build message: {0}")]
    Build(String),
    #[error("SMTP error: {0}")]
    Smtp(String),
    #[error("send timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Rejected(String),
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &RenderedMessage) -> Result<(), TransportError>;
}

/// SMTP relay transport built on lettre.
#[derive(Clone)]
pub struct SmtpMailer {
    transport: Arc<AsyncSmtpTransport<Tokio1Executor>>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn from_config(from: &str, smtp: &Smtp) -> Result<Self, TransportError> {
        let from: Mailbox = from
            .parse()
            .map_err(|_| TransportError::InvalidAddress(from.to_string()))?;

        let mut builder = match smtp.tls {
            TlsMode::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp.host),
            TlsMode::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp.host)
                .map_err(|e| TransportError::Smtp(e.to_string()))?,
            TlsMode::Starttls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp.host)
                .map_err(|e| TransportError::Smtp(e.to_string()))?,
        };
        builder = builder
            .port(smtp.port)
            .timeout(Some(Duration::from_secs(smtp.timeout_seconds)));
        if let (Some(username), Some(password)) = (smtp.username.clone(), smtp.password.clone()) {
            builder = builder.credentials(Credentials::new(username, password));
        }

        Ok(Self {
            transport: Arc::new(builder.build()),
            from,
        })
    }

    fn build_message(&self, message: &RenderedMessage) -> Result<Message, TransportError> {
        let to: Mailbox = message
            .to
            .parse()
            .map_err(|_| TransportError::InvalidAddress(message.to.clone()))?;
        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(&message.subject)
            .body(message.body.clone())
            .map_err(|e| TransportError::Build(e.to_string()))
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, message: &RenderedMessage) -> Result<(), TransportError> {
        let email = self.build_message(message)?;
        self.transport
            .send(email)
            .await
            .map_err(|e| TransportError::Smtp(e.to_string()))?;
        Ok(())
    }
}

/// Development transport: logs the message and reports success.
#[derive(Debug, Clone, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: &RenderedMessage) -> Result<(), TransportError> {
        info!(to = %message.to, subject = %message.subject, bytes = message.body.len(), "mail (log transport)");
        Ok(())
    }
}

/// Build the transport selected by `mail.transport`.
pub fn from_config(mail: &Mail) -> Result<Arc<dyn Mailer>, TransportError> {
    match (mail.transport, mail.smtp.as_ref()) {
        (TransportKind::Log, _) => Ok(Arc::new(LogMailer)),
        (TransportKind::Smtp, Some(smtp)) => Ok(Arc::new(SmtpMailer::from_config(&mail.from, smtp)?)),
        (TransportKind::Smtp, None) => Err(TransportError::Smtp("mail.smtp is not configured".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn smtp() -> Smtp {
        Smtp {
            host: "localhost".into(),
            port: 2525,
            username: None,
            password: None,
            tls: TlsMode::None,
            timeout_seconds: 1,
        }
    }

    fn message(to: &str) -> RenderedMessage {
        RenderedMessage {
            to: to.into(),
            subject: "Hello".into(),
            body: "Body".into(),
            unsubscribe_url: None,
        }
    }

    #[test]
    fn rejects_invalid_sender() {
        let err = SmtpMailer::from_config("not an address", &smtp()).err().unwrap();
        assert!(matches!(err, TransportError::InvalidAddress(_)));
    }

    #[tokio::test]
    async fn invalid_recipient_is_a_transport_error() {
        let mailer = SmtpMailer::from_config("sender@example.com", &smtp()).unwrap();
        let err = mailer.build_message(&message("nope")).unwrap_err();
        assert!(matches!(err, TransportError::InvalidAddress(addr) if addr == "nope"));
    }

    #[tokio::test]
    async fn builds_message_with_headers() {
        let mailer = SmtpMailer::from_config("Campaigns <sender@example.com>", &smtp()).unwrap();
        let email = mailer.build_message(&message("bob@example.com")).unwrap();
        let raw = String::from_utf8(email.formatted()).unwrap();
        assert!(raw.contains("Subject: Hello"));
        assert!(raw.contains("To: bob@example.com"));
    }

    #[tokio::test]
    async fn log_mailer_always_succeeds() {
        LogMailer.send(&message("x@example.com")).await.unwrap();
    }

    #[test]
    fn from_config_selects_transport() {
        let mail = Mail {
            transport: TransportKind::Smtp,
            from: "sender@example.com".into(),
            unsubscribe_base_url: None,
            smtp: None,
        };
        assert!(from_config(&mail).is_err());
        let mail = Mail {
            transport: TransportKind::Log,
            ..mail
        };
        assert!(from_config(&mail).is_ok());
    }
}
