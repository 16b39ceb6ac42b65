//! Format extraction engine.
//!
//! Maps an arbitrary JSON webhook payload onto the canonical [`Message`]
//! using the per-application [`CustomFormat`] templates. Extraction never
//! fails: unresolved or malformed templates leave the field at its zero
//! value and out of the returned [`FoundFields`]. Rejection is left to the
//! validation pass that follows.

pub mod template;

pub use template::{FieldPath, Location, Lookup, Rendered, Template, TemplateError};

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::Message;

/// One template per canonical field. Empty strings mean "not mapped".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomFormat {
    pub attachment: String,
    pub attachment_base64: String,
    pub attachment_type: String,
    pub device: String,
    pub html: String,
    pub message: String,
    pub priority: String,
    pub ttl: String,
    pub timestamp: String,
    pub title: String,
    pub url: String,
    pub url_title: String,
}

/// Canonical fields that can be populated by extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Field {
    Attachment,
    AttachmentBase64,
    AttachmentType,
    Device,
    Html,
    Message,
    Priority,
    Ttl,
    Timestamp,
    Title,
    Url,
    UrlTitle,
}

impl Field {
    pub const ALL: [Field; 12] = [
        Field::Attachment,
        Field::AttachmentBase64,
        Field::AttachmentType,
        Field::Device,
        Field::Html,
        Field::Message,
        Field::Priority,
        Field::Ttl,
        Field::Timestamp,
        Field::Title,
        Field::Url,
        Field::UrlTitle,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Field::Attachment => "attachment",
            Field::AttachmentBase64 => "attachment_base64",
            Field::AttachmentType => "attachment_type",
            Field::Device => "device",
            Field::Html => "html",
            Field::Message => "message",
            Field::Priority => "priority",
            Field::Ttl => "ttl",
            Field::Timestamp => "timestamp",
            Field::Title => "title",
            Field::Url => "url",
            Field::UrlTitle => "url_title",
        }
    }
}

impl CustomFormat {
    pub fn template_for(&self, field: Field) -> &str {
        match field {
            Field::Attachment => &self.attachment,
            Field::AttachmentBase64 => &self.attachment_base64,
            Field::AttachmentType => &self.attachment_type,
            Field::Device => &self.device,
            Field::Html => &self.html,
            Field::Message => &self.message,
            Field::Priority => &self.priority,
            Field::Ttl => &self.ttl,
            Field::Timestamp => &self.timestamp,
            Field::Title => &self.title,
            Field::Url => &self.url,
            Field::UrlTitle => &self.url_title,
        }
    }
}

/// Set of fields whose template resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FoundFields(BTreeSet<Field>);

impl FoundFields {
    pub fn contains(&self, field: Field) -> bool {
        self.0.contains(&field)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Field> + '_ {
        self.0.iter().copied()
    }

    fn insert(&mut self, field: Field) {
        self.0.insert(field);
    }
}

/// Named input locations available during extraction.
pub struct Locations<'a> {
    body: &'a Value,
}

impl<'a> Locations<'a> {
    pub fn new(body: &'a Value) -> Self {
        Self { body }
    }

    pub fn get(&self, location: Location) -> &'a Value {
        match location {
            Location::Body => self.body,
        }
    }

    fn lookup(&self, lookup: &Lookup) -> Option<String> {
        match lookup {
            Lookup::Webhook(path) => path
                .navigate(self.get(path.location))
                .and_then(template::render_value),
            Lookup::Arg(_) => None,
        }
    }
}

/// Evaluate every mapped template of `format` against `body`.
pub fn extract(format: &CustomFormat, body: &Value) -> (Message, FoundFields) {
    let locations = Locations::new(body);
    let mut message = Message::default();
    let mut found = FoundFields::default();

    for field in Field::ALL {
        let source = format.template_for(field);
        if source.is_empty() {
            continue;
        }

        let template = match Template::parse_field(source) {
            Ok(template) => template,
            Err(e) => {
                tracing::debug!(field = field.name(), error = %e, "Ignoring malformed template");
                continue;
            }
        };

        let rendered = template.render(|lookup| locations.lookup(lookup));
        if !rendered.found {
            continue;
        }

        found.insert(field);
        apply(&mut message, field, rendered.text);
    }

    (message, found)
}

fn apply(message: &mut Message, field: Field, text: String) {
    match field {
        Field::Attachment => message.attachment = text,
        Field::AttachmentBase64 => message.attachment_base64 = text,
        Field::AttachmentType => message.attachment_type = text,
        Field::Device => message.device = text,
        Field::Message => message.message = text,
        Field::Title => message.title = text,
        Field::Url => message.url = text,
        Field::UrlTitle => message.url_title = text,
        Field::Html => match text.trim() {
            "0" => message.html = 0,
            "1" => message.html = 1,
            _ => {}
        },
        Field::Priority => {
            let priority = text.trim().parse::<i32>().unwrap_or(0);
            message.priority = if (-2..=2).contains(&priority) {
                priority
            } else {
                0
            };
        }
        Field::Ttl => {
            message.ttl = text.trim().parse::<i64>().unwrap_or(0).max(0);
        }
        Field::Timestamp => {
            if let Some(timestamp) = parse_timestamp(&text) {
                message.timestamp = timestamp;
            }
        }
    }
}

/// Free-form date text to unix seconds.
fn parse_timestamp(text: &str) -> Option<i64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    if let Ok(seconds) = text.parse::<i64>() {
        return Some(seconds);
    }

    dateparser::parse(text).ok().map(|date| date.timestamp())
}
