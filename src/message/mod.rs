//! Canonical notification message.
//!
//! Every ingestion route normalizes its input into a [`Message`], which is
//! serialized onto the task queue and consumed by the dispatch worker.
//! JSON field names are part of the wire contract between ingress and worker.

mod validation;

pub use validation::{is_printable_ascii, ValidationError};

use serde::{Deserialize, Serialize};

/// Flags that must never be settable from outside the service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Internal {
    #[serde(default)]
    via_submit: bool,
}

/// The normalized notification record shared by ingestion and dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Application token (tenant + application identifier)
    #[serde(default)]
    pub token: String,
    /// Owning user key
    #[serde(default)]
    pub user: String,
    /// Message body
    #[serde(default)]
    pub message: String,

    /// Plain-text attachment
    #[serde(default)]
    pub attachment: String,
    /// Base64 encoded attachment, paired with `attachment_type`
    #[serde(default)]
    pub attachment_base64: String,
    /// MIME type of `attachment_base64`
    #[serde(default)]
    pub attachment_type: String,
    #[serde(default)]
    pub device: String,
    /// 0 or 1
    #[serde(default)]
    pub html: i32,
    /// -2 ..= 2
    #[serde(default)]
    pub priority: i32,
    /// Unix seconds
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub title: String,
    /// Seconds
    #[serde(default)]
    pub ttl: i64,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub url_title: String,

    #[serde(default, rename = "_internal")]
    pub(crate) internal: Internal,
}

impl Message {
    /// Reset every internal flag. Must be called right after a message has
    /// been populated from external input.
    pub fn clear_internal(&mut self) {
        self.internal = Internal::default();
    }

    pub fn set_via_submit(&mut self, via_submit: bool) {
        self.internal.via_submit = via_submit;
    }

    /// Whether the message entered through the reduced-trust submission route.
    pub fn is_via_submit(&self) -> bool {
        self.internal.via_submit
    }

    /// Overwrite the identity fields with resolver-supplied values.
    pub fn assign_identity(&mut self, token: &str, user: &str) {
        self.token = token.to_string();
        self.user = user.to_string();
    }

    /// Render the message as plain text for chat style targets.
    pub fn to_text(&self) -> String {
        let mut text = format!("{}\n\n{}\n", self.title, self.message);

        if !self.url_title.is_empty() {
            text.push('\n');
            text.push_str(&self.url_title);
        }

        if !self.url.is_empty() {
            text.push('\n');
            text.push_str(&self.url);
        }

        text
    }
}
