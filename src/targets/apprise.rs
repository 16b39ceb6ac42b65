//! Apprise delivery backend.
//!
//! Spawns `<interpreter> <apprise> -vv -t <title> -b <message> <connection>`
//! per notification. `connection` is a template rendered against the merged
//! arguments with `{{ arg "name" }}` actions; `prefix_destination`, when set,
//! is prepended to the rendered URL.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::{arg_string, required_arg, Backend, BackendError, TargetKind};
use crate::format::{Lookup, Template};
use crate::message::Message;
use crate::tenant::{Target, TargetArgs};

/// Wall clock limit for one apprise invocation.
pub const APPRISE_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_INTERPRETER: &str = "python";

#[derive(Debug, Clone)]
struct AppriseCommand {
    interpreter: String,
    apprise: String,
}

pub struct AppriseBackend {
    target_id: String,
    args: TargetArgs,
    command: Option<AppriseCommand>,
    timeout: Duration,
}

impl AppriseBackend {
    pub fn new(target: &Target) -> Self {
        Self {
            target_id: target.id.clone(),
            args: target.args.clone(),
            command: None,
            timeout: APPRISE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Render the connection URL for one delivery.
fn render_connection(args: &TargetArgs) -> Result<String, BackendError> {
    let source = required_arg(args, "connection")?;
    let template = Template::parse(&source)
        .map_err(|e| BackendError::Config(format!("Could not parse connection argument: {}", e)))?;

    let rendered = template.render(|lookup| match lookup {
        Lookup::Arg(name) => arg_string(args, name),
        Lookup::Webhook(_) => None,
    });

    let mut connection = rendered.text;
    if let Some(prefix) = arg_string(args, "prefix_destination") {
        connection.insert_str(0, &prefix);
    }

    if connection.trim().is_empty() {
        return Err(BackendError::Config("connection rendered empty".to_string()));
    }
    Ok(connection)
}

/// Last few lines of process output, for error messages.
fn tail(output: &[u8]) -> String {
    let text = String::from_utf8_lossy(output);
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(5)..].join("\n")
}

#[async_trait]
impl Backend for AppriseBackend {
    fn kind(&self) -> TargetKind {
        TargetKind::Apprise
    }

    async fn load(&mut self) -> Result<(), BackendError> {
        let apprise = required_arg(&self.args, "apprise")?;
        let interpreter = arg_string(&self.args, "interpreter")
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_INTERPRETER.to_string());

        if let Some(connection) = arg_string(&self.args, "connection") {
            Template::parse(&connection).map_err(|e| {
                BackendError::Config(format!("Could not parse connection argument: {}", e))
            })?;
        }

        self.command = Some(AppriseCommand {
            interpreter,
            apprise,
        });
        Ok(())
    }

    async fn run(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn execute(&mut self, message: &Message, args: &TargetArgs) -> Result<(), BackendError> {
        let command = self.command.as_ref().ok_or(BackendError::NotReady("load"))?;
        let connection = render_connection(args)?;

        let mut child = Command::new(&command.interpreter);
        child
            .arg(&command.apprise)
            .arg("-vv")
            .arg("-t")
            .arg(&message.title)
            .arg("-b")
            .arg(&message.message)
            .arg(&connection)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, child.output()).await {
            Ok(output) => output?,
            Err(_) => {
                tracing::warn!(target_id = %self.target_id, "apprise timed out, child killed");
                return Err(BackendError::Timeout(self.timeout));
            }
        };

        tracing::debug!(
            target_id = %self.target_id,
            status = %output.status,
            stdout = %String::from_utf8_lossy(&output.stdout),
            stderr = %String::from_utf8_lossy(&output.stderr),
            "apprise finished"
        );

        if !output.status.success() {
            return Err(BackendError::Delivery(format!(
                "apprise exited with {}: {}",
                output.status,
                tail(&output.stderr)
            )));
        }

        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), BackendError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: serde_json::Value) -> TargetArgs {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_render_connection() {
        let merged = args(json!({
            "connection": "xmpp://{{ arg \"user\" }}:{{ arg \"pass\" }}@example.org",
            "user": "bot",
            "pass": "pw"
        }));
        assert_eq!(render_connection(&merged).unwrap(), "xmpp://bot:pw@example.org");

        let prefixed = args(json!({
            "connection": "{{ arg \"channel\" }}",
            "channel": "alerts",
            "prefix_destination": "tgram://bottoken/"
        }));
        assert_eq!(render_connection(&prefixed).unwrap(), "tgram://bottoken/alerts");
    }

    #[test]
    fn test_render_connection_errors() {
        assert!(matches!(
            render_connection(&args(json!({}))),
            Err(BackendError::Config(_))
        ));
        assert!(matches!(
            render_connection(&args(json!({"connection": "{{ arg \"x\""}))),
            Err(BackendError::Config(_))
        ));
        assert!(matches!(
            render_connection(&args(json!({"connection": "{{ arg \"missing\" }}"}))),
            Err(BackendError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_load_requires_apprise_path() {
        let target = Target {
            id: "a".to_string(),
            enable: true,
            kind: "apprise".to_string(),
            args: args(json!({"connection": "json://hook"})),
        };
        let mut backend = AppriseBackend::new(&target);
        assert!(matches!(backend.load().await, Err(BackendError::Config(_))));
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use std::path::PathBuf;

        fn write_script(name: &str, body: &str) -> PathBuf {
            let path = std::env::temp_dir().join(format!("{}-{}.sh", name, uuid::Uuid::new_v4()));
            std::fs::write(&path, body).unwrap();
            path
        }

        async fn create_test_backend(script: &PathBuf, timeout: Duration) -> AppriseBackend {
            let target = Target {
                id: "apprise-test".to_string(),
                enable: true,
                kind: "apprise".to_string(),
                args: args(json!({
                    "interpreter": "sh",
                    "apprise": script.to_string_lossy(),
                    "connection": "json://localhost/{{ arg \"path\" }}"
                })),
            };
            let mut backend = AppriseBackend::new(&target).with_timeout(timeout);
            backend.load().await.unwrap();
            backend.run().await.unwrap();
            backend
        }

        fn merged() -> TargetArgs {
            args(json!({
                "connection": "json://localhost/{{ arg \"path\" }}",
                "path": "hook"
            }))
        }

        #[tokio::test]
        async fn test_invocation_arguments() {
            let out = std::env::temp_dir().join(format!("apprise-args-{}", uuid::Uuid::new_v4()));
            let script = write_script(
                "apprise-echo",
                &format!("printf '%s|' \"$@\" > '{}'\n", out.display()),
            );
            let mut backend = create_test_backend(&script, APPRISE_TIMEOUT).await;

            let message = Message {
                title: "Alert".to_string(),
                message: "Disk full".to_string(),
                ..Default::default()
            };
            backend.execute(&message, &merged()).await.unwrap();

            let recorded = std::fs::read_to_string(&out).unwrap();
            assert_eq!(recorded, "-vv|-t|Alert|-b|Disk full|json://localhost/hook|");

            let _ = std::fs::remove_file(out);
            let _ = std::fs::remove_file(script);
        }

        #[tokio::test]
        async fn test_non_zero_exit_is_delivery_error() {
            let script = write_script("apprise-fail", "echo 'bad url' >&2\nexit 3\n");
            let mut backend = create_test_backend(&script, APPRISE_TIMEOUT).await;

            let err = backend.execute(&Message::default(), &merged()).await.unwrap_err();
            match err {
                BackendError::Delivery(reason) => assert!(reason.contains("bad url")),
                other => panic!("unexpected error: {}", other),
            }
            let _ = std::fs::remove_file(script);
        }

        #[tokio::test]
        async fn test_slow_child_times_out() {
            let script = write_script("apprise-slow", "sleep 5\n");
            let mut backend = create_test_backend(&script, Duration::from_millis(200)).await;

            let err = backend.execute(&Message::default(), &merged()).await.unwrap_err();
            assert!(matches!(err, BackendError::Timeout(_)));
            let _ = std::fs::remove_file(script);
        }
    }
}
