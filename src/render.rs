//! Per-recipient rendering of campaign subject and body.
//!
//! Placeholders use the `{{token}}` form (whitespace inside the braces is
//! tolerated). Recognised tokens are `name`, `email` and `unsubscribe_url`;
//! anything else is left exactly as written.
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::model::{Campaign, Subscriber};

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("valid placeholder regex"));

/// Values available to a template for one recipient.
#[derive(Debug, Clone, Copy)]
pub struct Recipient<'a> {
    pub name: &'a str,
    pub email: &'a str,
    pub unsubscribe_url: Option<&'a str>,
}

impl<'a> Recipient<'a> {
    pub fn from_subscriber(subscriber: &'a Subscriber, unsubscribe_url: Option<&'a str>) -> Self {
        Self {
            name: &subscriber.name,
            email: &subscriber.email,
            unsubscribe_url,
        }
    }

    fn lookup(&self, token: &str) -> Option<&'a str> {
        match token {
            "name" => Some(self.name),
            "email" => Some(self.email),
            "unsubscribe_url" => Some(self.unsubscribe_url.unwrap_or("")),
            _ => None,
        }
    }
}

/// Replace every recognised placeholder in `template`.
pub fn substitute(template: &str, recipient: &Recipient<'_>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| match recipient.lookup(&caps[1]) {
            Some(value) => value.to_string(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// A campaign rendered for a single subscriber, ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub unsubscribe_url: Option<String>,
}

/// Build the unsubscribe link for a token, or `None` when no base URL is configured.
pub fn unsubscribe_url(base_url: Option<&str>, token: &str) -> Option<String> {
    let base = base_url.map(str::trim).filter(|b| !b.is_empty())?;
    Some(format!("{}/{}", base.trim_end_matches('/'), token))
}

pub fn render_message(
    campaign: &Campaign,
    subscriber: &Subscriber,
    unsubscribe_base_url: Option<&str>,
) -> RenderedMessage {
    let link = unsubscribe_url(unsubscribe_base_url, &subscriber.unsubscribe_token);
    let recipient = Recipient::from_subscriber(subscriber, link.as_deref());

    let mut body = substitute(&campaign.body, &recipient);
    if let Some(url) = link.as_deref() {
        if !body.contains(url) {
            body.push_str("\n\n--\nUnsubscribe: ");
            body.push_str(url);
        }
    }

    RenderedMessage {
        to: subscriber.email.clone(),
        subject: substitute(&campaign.subject, &recipient),
        body,
        unsubscribe_url: link,
    }
}
