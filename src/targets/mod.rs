//! Delivery targets.
//!
//! Each configured target gets one [`Backend`] instance, driven through the
//! lifecycle `Uninitialized -> Loaded -> Running -> Shutdown` by the
//! [`TargetRegistry`]. Backends:
//!
//! - `xmpp`: persistent XMPP session, chat message per notification
//! - `apprise`: spawns the `apprise` CLI per notification

pub mod apprise;
mod registry;
pub mod xmpp;

pub use apprise::AppriseBackend;
pub use registry::{RegistryError, TargetRegistry};
pub use xmpp::{ChatConnector, ChatSession, TokioXmppConnector, XmppBackend};

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::message::Message;
use crate::tenant::{Target, TargetArgs};

/// Errors raised by a backend.
#[derive(Error, Debug)]
pub enum BackendError {
    /// Target or per-message arguments are unusable
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Session could not be established or was lost
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The external system refused or failed the delivery
    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Lifecycle method called in the wrong state
    #[error("Backend not ready: {0}")]
    NotReady(&'static str),
}

impl BackendError {
    /// Whether the failure points at a broken session rather than at the
    /// message or its arguments.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            BackendError::Connection(_) | BackendError::Timeout(_) | BackendError::Io(_)
        )
    }
}

/// Closed set of supported target types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    Xmpp,
    Apprise,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unsupported target type: {0}")]
pub struct UnsupportedTargetType(pub String);

impl FromStr for TargetKind {
    type Err = UnsupportedTargetType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "xmpp" => Ok(TargetKind::Xmpp),
            "apprise" => Ok(TargetKind::Apprise),
            other => Err(UnsupportedTargetType(other.to_string())),
        }
    }
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Xmpp => "xmpp",
            TargetKind::Apprise => "apprise",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one target slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Loaded,
    Running,
    Shutdown,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Loaded => "loaded",
            LifecycleState::Running => "running",
            LifecycleState::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Capability contract every delivery backend implements.
///
/// The registry serializes calls per instance, so methods take `&mut self`.
#[async_trait]
pub trait Backend: Send {
    fn kind(&self) -> TargetKind;

    /// Validate configuration. No network I/O.
    async fn load(&mut self) -> Result<(), BackendError>;

    /// Establish long-lived resources.
    async fn run(&mut self) -> Result<(), BackendError>;

    /// Deliver one message with the merged per-application arguments.
    async fn execute(&mut self, message: &Message, args: &TargetArgs) -> Result<(), BackendError>;

    /// Release resources. Must be safe when `run` never succeeded.
    async fn shutdown(&mut self) -> Result<(), BackendError>;
}

/// Build the backend for `target` using the production XMPP connector.
pub fn build_backend(target: &Target) -> Result<Box<dyn Backend>, UnsupportedTargetType> {
    build_backend_with(target, Arc::new(TokioXmppConnector))
}

/// Build the backend for `target` with an explicit XMPP connector.
pub fn build_backend_with(
    target: &Target,
    connector: Arc<dyn ChatConnector>,
) -> Result<Box<dyn Backend>, UnsupportedTargetType> {
    let backend: Box<dyn Backend> = match target.kind.parse::<TargetKind>()? {
        TargetKind::Xmpp => Box::new(XmppBackend::new(target, connector)),
        TargetKind::Apprise => Box::new(AppriseBackend::new(target)),
    };
    Ok(backend)
}

/// Read an argument as text. Numbers and booleans are printed as JSON.
pub fn arg_string(args: &TargetArgs, key: &str) -> Option<String> {
    match args.get(key)? {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Read a required, non-empty text argument.
pub fn required_arg(args: &TargetArgs, key: &str) -> Result<String, BackendError> {
    match arg_string(args, key) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(BackendError::Config(format!("missing argument: {}", key))),
    }
}

/// Read a boolean argument given as JSON bool or text.
pub fn arg_bool(args: &TargetArgs, key: &str, default: bool) -> Result<bool, BackendError> {
    match args.get(key) {
        None | Some(serde_json::Value::Null) => Ok(default),
        Some(serde_json::Value::Bool(value)) => Ok(*value),
        Some(serde_json::Value::String(s)) => match s.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(BackendError::Config(format!("invalid boolean for {}: {}", key, s))),
        },
        Some(other) => Err(BackendError::Config(format!(
            "invalid boolean for {}: {}",
            key, other
        ))),
    }
}
