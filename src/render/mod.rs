//! Template rendering: turns one batch record plus its message template into
//! the sender, recipient and body handed to the provider.
//!
//! Rendering is pure. It never mutates the record or template and the same
//! inputs always produce the same output.

use crate::batch::Record;
use crate::config::types::{ColumnConfig, MissingFieldPolicy};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::OnceLock;
use thiserror::Error;

/// Message template as held by the template store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    /// Body text containing `{{field}}` placeholders
    pub body: String,
    /// Record column holding the sender id for messages using this template
    pub sender_field: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub sender_id: String,
    pub recipient: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("no template found for id '{0}'")]
    MissingTemplate(String),

    #[error("template '{0}' has an empty body")]
    EmptyBody(String),

    #[error("placeholder '{{{{{0}}}}}' has no matching record field")]
    UnmappedPlaceholder(String),

    #[error("record has no recipient in column '{0}'")]
    MissingRecipient(String),

    #[error("sender id '{0}' is not alphanumeric")]
    InvalidSender(String),
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s?([A-Za-z0-9_]+)\s?\}\}").expect("placeholder pattern is valid")
    })
}

/// Renders records against templates using the configured column names
#[derive(Debug, Clone)]
pub struct Renderer {
    columns: ColumnConfig,
    missing_field: MissingFieldPolicy,
}

impl Renderer {
    pub fn new(columns: ColumnConfig, missing_field: MissingFieldPolicy) -> Self {
        Self {
            columns,
            missing_field,
        }
    }

    /// Render `record` with `template`.
    ///
    /// An absent template or one with an empty body is an error; the caller
    /// routes such records to failed output instead of dispatching them.
    pub fn render(
        &self,
        record: &Record,
        template: Option<&Template>,
    ) -> Result<RenderedMessage, RenderError> {
        let template = template.ok_or_else(|| {
            RenderError::MissingTemplate(
                record
                    .get(&self.columns.template_id)
                    .unwrap_or_default()
                    .to_string(),
            )
        })?;
        if template.body.is_empty() {
            return Err(RenderError::EmptyBody(template.id.clone()));
        }

        let sender_id = strip_plus(record.get(&template.sender_field).unwrap_or_default());
        if sender_id.is_empty() || !sender_id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(RenderError::InvalidSender(sender_id));
        }

        let recipient = strip_plus(record.get(&self.columns.phone).unwrap_or_default());
        if recipient.is_empty() {
            return Err(RenderError::MissingRecipient(self.columns.phone.clone()));
        }

        let body = self.substitute(&template.body, record)?;

        Ok(RenderedMessage {
            sender_id,
            recipient,
            body,
        })
    }

    fn substitute(&self, body: &str, record: &Record) -> Result<String, RenderError> {
        let mut text = body.to_string();
        let mut seen = HashSet::new();

        for caps in placeholder_pattern().captures_iter(body) {
            let Some(token) = caps.get(0).map(|m| m.as_str()) else {
                continue;
            };
            if !seen.insert(token) {
                continue;
            }
            let field = &caps[1];
            let value = match record.get(field) {
                Some(value) => value,
                None => match self.missing_field {
                    MissingFieldPolicy::Blank => "",
                    MissingFieldPolicy::Undefined => "undefined",
                    MissingFieldPolicy::Error => {
                        return Err(RenderError::UnmappedPlaceholder(field.to_string()))
                    }
                },
            };
            text = text.replace(token, value);
        }

        Ok(text)
    }
}

fn strip_plus(value: &str) -> String {
    value.replace('+', "")
}

/// Whether the body needs the provider's unicode message type
pub fn is_unicode(text: &str) -> bool {
    text.chars().any(|c| c as u32 > 0xFF)
}
