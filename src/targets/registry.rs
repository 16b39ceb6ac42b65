//! Backend registry keyed by target id.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::Mutex;

use super::{build_backend_with, Backend, BackendError, ChatConnector, LifecycleState, TargetKind};
use super::{TokioXmppConnector, UnsupportedTargetType};
use crate::message::Message;
use crate::metrics::{TARGET_ERRORS_TOTAL, TARGET_EXECUTE_DURATION_SECONDS};
use crate::tenant::{Target, TargetArgs};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Target {id}: {source}")]
    Unsupported {
        id: String,
        #[source]
        source: UnsupportedTargetType,
    },

    #[error("Unknown target: {0}")]
    UnknownTarget(String),

    #[error("Target {id} is not running (state: {state})")]
    NotRunning { id: String, state: LifecycleState },

    #[error("Target {id} failed: {source}")]
    Backend {
        id: String,
        #[source]
        source: BackendError,
    },

    #[error("{} target(s) failed to shut down: {}", .0.len(), format_failures(.0))]
    Shutdown(Vec<(String, BackendError)>),
}

fn format_failures(failures: &[(String, BackendError)]) -> String {
    failures
        .iter()
        .map(|(id, e)| format!("{}: {}", id, e))
        .collect::<Vec<_>>()
        .join("; ")
}

struct TargetSlot {
    state: LifecycleState,
    backend: Box<dyn Backend>,
}

/// One backend per target, each behind its own lock.
///
/// Calls on the same target are serialized; different targets proceed in
/// parallel. Iteration is in target id order.
pub struct TargetRegistry {
    slots: BTreeMap<String, Mutex<TargetSlot>>,
}

impl TargetRegistry {
    /// Build one backend per given target. Callers decide which targets to pass.
    pub fn from_targets(targets: &[Target]) -> Result<Self, RegistryError> {
        Self::from_targets_with(targets, Arc::new(TokioXmppConnector))
    }

    pub fn from_targets_with(
        targets: &[Target],
        connector: Arc<dyn ChatConnector>,
    ) -> Result<Self, RegistryError> {
        let mut backends = Vec::with_capacity(targets.len());
        for target in targets {
            let backend = build_backend_with(target, connector.clone()).map_err(|source| {
                RegistryError::Unsupported {
                    id: target.id.clone(),
                    source,
                }
            })?;
            backends.push((target.id.clone(), backend));
        }
        Ok(Self::with_backends(backends))
    }

    /// Assemble a registry from already constructed backends.
    pub fn with_backends<I>(backends: I) -> Self
    where
        I: IntoIterator<Item = (String, Box<dyn Backend>)>,
    {
        let slots = backends
            .into_iter()
            .map(|(id, backend)| {
                let slot = TargetSlot {
                    state: LifecycleState::Uninitialized,
                    backend,
                };
                (id, Mutex::new(slot))
            })
            .collect();
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn target_ids(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    pub async fn state(&self, id: &str) -> Option<LifecycleState> {
        match self.slots.get(id) {
            Some(slot) => Some(slot.lock().await.state),
            None => None,
        }
    }

    /// Validate every target. Stops at the first failure.
    pub async fn load_all(&self) -> Result<(), RegistryError> {
        for (id, slot) in &self.slots {
            let mut slot = slot.lock().await;
            slot.backend
                .load()
                .await
                .map_err(|source| RegistryError::Backend {
                    id: id.clone(),
                    source,
                })?;
            slot.state = LifecycleState::Loaded;
            tracing::debug!(target_id = %id, kind = %slot.backend.kind(), "Target loaded");
        }
        Ok(())
    }

    /// Start every target in id order, all or nothing.
    ///
    /// On failure the targets started so far are shut down, the remaining
    /// ones are left untouched and the error is returned.
    pub async fn run_all(&self) -> Result<(), RegistryError> {
        let mut started: Vec<&str> = Vec::new();

        for (id, slot) in &self.slots {
            let mut guard = slot.lock().await;
            if guard.state != LifecycleState::Loaded {
                let state = guard.state;
                drop(guard);
                self.rollback(&started).await;
                return Err(RegistryError::NotRunning {
                    id: id.clone(),
                    state,
                });
            }

            match guard.backend.run().await {
                Ok(()) => {
                    guard.state = LifecycleState::Running;
                    started.push(id.as_str());
                    tracing::info!(target_id = %id, kind = %guard.backend.kind(), "Target running");
                }
                Err(source) => {
                    tracing::error!(target_id = %id, error = %source, "Target failed to start");
                    // shut down the failed one as well, its session may be half open
                    if let Err(e) = guard.backend.shutdown().await {
                        tracing::warn!(target_id = %id, error = %e, "Cleanup after failed start");
                    }
                    guard.state = LifecycleState::Shutdown;
                    drop(guard);
                    self.rollback(&started).await;
                    return Err(RegistryError::Backend {
                        id: id.clone(),
                        source,
                    });
                }
            }
        }

        Ok(())
    }

    async fn rollback(&self, started: &[&str]) {
        for id in started.iter().rev() {
            if let Some(slot) = self.slots.get(*id) {
                let mut slot = slot.lock().await;
                if let Err(e) = slot.backend.shutdown().await {
                    tracing::warn!(target_id = %id, error = %e, "Rollback shutdown failed");
                }
                slot.state = LifecycleState::Shutdown;
            }
        }
    }

    /// Deliver `message` through target `id`.
    #[tracing::instrument(name = "registry.execute", skip(self, message, args), fields(target_id = %id))]
    pub async fn execute(
        &self,
        id: &str,
        message: &Message,
        args: &TargetArgs,
    ) -> Result<(), RegistryError> {
        let slot = self
            .slots
            .get(id)
            .ok_or_else(|| RegistryError::UnknownTarget(id.to_string()))?;
        let mut slot = slot.lock().await;

        if slot.state != LifecycleState::Running {
            return Err(RegistryError::NotRunning {
                id: id.to_string(),
                state: slot.state,
            });
        }

        let kind: TargetKind = slot.backend.kind();
        let started = Instant::now();
        let result = slot.backend.execute(message, args).await;

        TARGET_EXECUTE_DURATION_SECONDS
            .with_label_values(&[kind.as_str()])
            .observe(started.elapsed().as_secs_f64());

        result.map_err(|source| {
            TARGET_ERRORS_TOTAL.with_label_values(&[kind.as_str()]).inc();
            RegistryError::Backend {
                id: id.to_string(),
                source,
            }
        })
    }

    /// Shut down every target, collecting failures.
    pub async fn shutdown_all(&self) -> Result<(), RegistryError> {
        let mut failures = Vec::new();

        for (id, slot) in &self.slots {
            let mut slot = slot.lock().await;
            if slot.state == LifecycleState::Shutdown {
                continue;
            }

            if let Err(e) = slot.backend.shutdown().await {
                tracing::warn!(target_id = %id, error = %e, "Target shutdown failed");
                failures.push((id.clone(), e));
            }
            slot.state = LifecycleState::Shutdown;
        }

        if failures.is_empty() {
            tracing::info!(targets = self.slots.len(), "All targets shut down");
            Ok(())
        } else {
            Err(RegistryError::Shutdown(failures))
        }
    }
}
