//! Optional per-field encryption applied before dispatch.
//!
//! Enabled fields are encrypted independently to every recipient of the
//! application's policy with age (X25519 recipients) and replaced in place by
//! ASCII-armored ciphertext. Failures are never retried.

use std::fmt;
use std::io::Write;
use std::str::FromStr;

use age::armor::{ArmoredWriter, Format};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::Message;

#[derive(Error, Debug)]
pub enum EncryptionError {
    #[error("invalid age recipient {recipient:?}: {reason}")]
    InvalidRecipient { recipient: String, reason: String },

    #[error("encryption enabled without recipients")]
    NoRecipients,

    #[error("unknown encryption type: {0}")]
    UnknownType(String),

    #[error("encryption failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("encryption failed: {0}")]
    Age(#[from] age::EncryptError),

    #[error("armored output is not UTF-8")]
    Encoding(#[from] std::string::FromUtf8Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionType {
    #[default]
    None,
    Age,
}

impl FromStr for EncryptionType {
    type Err = EncryptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(EncryptionType::None),
            "age" => Ok(EncryptionType::Age),
            other => Err(EncryptionError::UnknownType(other.to_string())),
        }
    }
}

impl fmt::Display for EncryptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncryptionType::None => write!(f, "none"),
            EncryptionType::Age => write!(f, "age"),
        }
    }
}

/// Which fields to encrypt, and for whom.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncryptionPolicy {
    pub kind: EncryptionType,
    pub recipients: Vec<String>,
    pub title: bool,
    pub message: bool,
    pub attachment: bool,
}

impl EncryptionPolicy {
    pub fn is_active(&self) -> bool {
        self.kind == EncryptionType::Age && (self.title || self.message || self.attachment)
    }
}

fn parse_recipients(recipients: &[String]) -> Result<Vec<age::x25519::Recipient>, EncryptionError> {
    if recipients.is_empty() {
        return Err(EncryptionError::NoRecipients);
    }

    recipients
        .iter()
        .map(|raw| {
            raw.trim()
                .parse::<age::x25519::Recipient>()
                .map_err(|reason| EncryptionError::InvalidRecipient {
                    recipient: raw.clone(),
                    reason: reason.to_string(),
                })
        })
        .collect()
}

/// Encrypt `plaintext` to all `recipients`, returning ASCII armor.
fn armor(plaintext: &str, recipients: &[age::x25519::Recipient]) -> Result<String, EncryptionError> {
    let boxed: Vec<Box<dyn age::Recipient + Send>> = recipients
        .iter()
        .cloned()
        .map(|r| Box::new(r) as Box<dyn age::Recipient + Send>)
        .collect();
    let encryptor = age::Encryptor::with_recipients(boxed).ok_or(EncryptionError::NoRecipients)?;

    let mut output = Vec::new();
    let armored = ArmoredWriter::wrap_output(&mut output, Format::AsciiArmor)?;
    let mut writer = encryptor.wrap_output(armored)?;
    writer.write_all(plaintext.as_bytes())?;
    writer.finish().and_then(|armor| armor.finish())?;

    Ok(String::from_utf8(output)?)
}

/// Apply `policy` to `message`, replacing enabled fields with ciphertext.
///
/// Returns whether anything was encrypted.
pub fn encrypt_message(
    message: &mut Message,
    policy: &EncryptionPolicy,
) -> Result<bool, EncryptionError> {
    if !policy.is_active() {
        return Ok(false);
    }

    let recipients = parse_recipients(&policy.recipients)?;
    let mut changed = false;

    if policy.title {
        message.title = armor(&message.title, &recipients)?;
        changed = true;
    }

    if policy.message {
        message.message = armor(&message.message, &recipients)?;
        changed = true;
    }

    if policy.attachment {
        if !message.attachment.is_empty() {
            message.attachment = armor(&message.attachment, &recipients)?;
            changed = true;
        } else if !message.attachment_base64.is_empty() && !message.attachment_type.is_empty() {
            message.attachment_base64 = armor(&message.attachment_base64, &recipients)?;
            changed = true;
        }
    }

    tracing::debug!(
        recipients = recipients.len(),
        title = policy.title,
        message = policy.message,
        attachment = policy.attachment,
        "Message encrypted"
    );

    Ok(changed)
}
