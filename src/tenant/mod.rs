//! Tenant model: users, their applications and delivery targets.
//!
//! Records come from a [`Repository`](crate::repository::Repository) and are
//! stitched together by the [`Resolver`].

mod resolver;

pub use resolver::{merge_target_args, ResolveError, ResolvedTarget, Resolver, REPOSITORY_TIMEOUT};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::encryption::{EncryptionPolicy, EncryptionType};
use crate::format::CustomFormat;

/// Flat argument map handed to a backend.
pub type TargetArgs = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub key: String,
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default)]
    pub applications: Vec<Application>,
}

impl User {
    pub fn application(&self, token: &str) -> Option<&Application> {
        self.applications.iter().find(|app| app.token == token)
    }
}

/// How the application-format route interprets request bodies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppFormat {
    #[default]
    Pushover,
    Custom,
}

impl FromStr for AppFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pushover" | "" => Ok(AppFormat::Pushover),
            "custom" => Ok(AppFormat::Custom),
            other => Err(format!("unknown application format: {}", other)),
        }
    }
}

impl fmt::Display for AppFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppFormat::Pushover => write!(f, "pushover"),
            AppFormat::Custom => write!(f, "custom"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub token: String,
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub icon_path: Option<String>,
    #[serde(default)]
    pub format: AppFormat,
    #[serde(default)]
    pub custom_format: CustomFormat,

    #[serde(default)]
    pub encryption_type: EncryptionType,
    #[serde(default)]
    pub encryption_recipients: Vec<String>,
    #[serde(default)]
    pub encrypt_title: bool,
    #[serde(default)]
    pub encrypt_message: bool,
    #[serde(default)]
    pub encrypt_attachment: bool,

    /// Target id
    pub target: String,
    /// Flat argument map, or one map per target id
    #[serde(default)]
    pub target_args: TargetArgs,
}

impl Application {
    pub fn encryption_policy(&self) -> EncryptionPolicy {
        EncryptionPolicy {
            kind: self.encryption_type,
            recipients: self.encryption_recipients.clone(),
            title: self.encrypt_title,
            message: self.encrypt_message,
            attachment: self.encrypt_attachment,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub args: TargetArgs,
}

fn default_true() -> bool {
    true
}
