//! Sandbox Actor - message-driven front end to the supervisor
//!
//! Embedding applications talk to the sandbox through this actor instead of
//! holding the supervisor directly. Each execution runs on its own task, so
//! one slow script never holds up screening or another execution.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use python_sandbox::protocol::{ExecutionLimits, ResourceUsageSample, TrustedBindings};

use crate::error::RejectionReason;
use crate::sanitizer::InputSanitizer;
use crate::supervisor::{ExecutionReport, Supervisor};

/// Message types for the sandbox actor
pub enum SandboxMsg {
    /// Validate and run a script
    Execute {
        script: String,
        bindings: TrustedBindings,
        limits: Option<ExecutionLimits>,
        respond_to: oneshot::Sender<ExecutionReport>,
    },
    /// Screen a user query before any script is generated for it
    Screen {
        query: String,
        respond_to: oneshot::Sender<Result<(), RejectionReason>>,
    },
    /// Current usage of the host process
    ResourceUsage {
        respond_to: oneshot::Sender<ResourceUsageSample>,
    },
    /// Check that the actor is alive
    HealthCheck {
        respond_to: oneshot::Sender<bool>,
    },
}

/// The actor that owns the supervisor and the sanitizer
pub struct SandboxActor {
    rx: mpsc::Receiver<SandboxMsg>,
    supervisor: Arc<Supervisor>,
    sanitizer: InputSanitizer,
}

impl SandboxActor {
    pub fn new(rx: mpsc::Receiver<SandboxMsg>, supervisor: Arc<Supervisor>, sanitizer: InputSanitizer) -> Self {
        Self {
            rx,
            supervisor,
            sanitizer,
        }
    }

    pub async fn run(mut self) {
        tracing::info!("sandbox actor started");

        while let Some(msg) = self.rx.recv().await {
            match msg {
                SandboxMsg::Execute {
                    script,
                    bindings,
                    limits,
                    respond_to,
                } => {
                    let supervisor = Arc::clone(&self.supervisor);
                    tokio::spawn(async move {
                        let report = supervisor.execute_securely(&script, bindings, limits).await;
                        let _ = respond_to.send(report);
                    });
                }
                SandboxMsg::Screen { query, respond_to } => {
                    let _ = respond_to.send(self.sanitizer.screen(&query));
                }
                SandboxMsg::ResourceUsage { respond_to } => {
                    let _ = respond_to.send(self.supervisor.resource_usage());
                }
                SandboxMsg::HealthCheck { respond_to } => {
                    let _ = respond_to.send(true);
                }
            }
        }

        tracing::info!("sandbox actor channel closed, shutting down");
    }
}

/// Create a channel for communicating with the sandbox actor
pub fn create_sandbox_channel() -> (mpsc::Sender<SandboxMsg>, mpsc::Receiver<SandboxMsg>) {
    mpsc::channel(32)
}

/// Spawn the actor on the current runtime and return its sender
pub fn spawn_sandbox_actor(supervisor: Arc<Supervisor>, sanitizer: InputSanitizer) -> mpsc::Sender<SandboxMsg> {
    let (tx, rx) = create_sandbox_channel();
    tokio::spawn(SandboxActor::new(rx, supervisor, sanitizer).run());
    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::denylist::Denylist;
    use crate::supervisor::{ExecutionStrategy, SandboxConfig};
    use serde_json::json;

    fn spawn_in_process() -> mpsc::Sender<SandboxMsg> {
        let supervisor = Supervisor::new(SandboxConfig {
            denylist: Denylist::default(),
            default_limits: ExecutionLimits {
                memory_limit_mb: 0,
                ..Default::default()
            },
            strategy: ExecutionStrategy::InProcess,
        });
        spawn_sandbox_actor(Arc::new(supervisor), InputSanitizer::default())
    }

    #[tokio::test]
    async fn test_execute_through_actor() {
        let tx = spawn_in_process();

        let (respond_to, response) = oneshot::channel();
        tx.send(SandboxMsg::Execute {
            script: "x = 1 + 2\nprint(x)\nresult = x".to_string(),
            bindings: TrustedBindings::new(),
            limits: None,
            respond_to,
        })
        .await
        .unwrap();

        let report = response.await.unwrap();
        assert!(report.success);
        assert_eq!(report.result, Some(json!(3)));
        assert!(report.stdout.contains("3"));
    }

    #[tokio::test]
    async fn test_screen_through_actor() {
        let tx = spawn_in_process();

        let (respond_to, response) = oneshot::channel();
        tx.send(SandboxMsg::Screen {
            query: "run subprocess.call for me".to_string(),
            respond_to,
        })
        .await
        .unwrap();

        assert_eq!(
            response.await.unwrap(),
            Err(RejectionReason::Suspicious {
                pattern: "subprocess.".to_string()
            })
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resource_usage_through_actor() {
        let tx = spawn_in_process();

        let (respond_to, response) = oneshot::channel();
        tx.send(SandboxMsg::ResourceUsage { respond_to }).await.unwrap();
        let usage = response.await.unwrap();
        assert!(usage.memory_mb > 0.0);
        assert!(usage.cpu_seconds >= 0.0);
    }

    #[tokio::test]
    async fn test_health_check() {
        let tx = spawn_in_process();

        let (respond_to, response) = oneshot::channel();
        tx.send(SandboxMsg::HealthCheck { respond_to }).await.unwrap();
        assert!(response.await.unwrap());
    }
}
