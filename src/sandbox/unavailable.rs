//! Runtime stub for deployments without sandbox execution

use tokio::sync::broadcast;

use crate::error::{CollabError, Result};
use crate::model::FileTree;
use crate::sandbox::{PreviewAddress, SandboxProcess, SandboxRuntime};

/// Rejects every operation with [`CollabError::SandboxUnavailable`].
#[derive(Debug)]
pub struct UnavailableSandbox {
    reason: String,
    ready_tx: broadcast::Sender<PreviewAddress>,
}

impl UnavailableSandbox {
    pub fn new(reason: impl Into<String>) -> Self {
        let (ready_tx, _) = broadcast::channel(1);
        Self {
            reason: reason.into(),
            ready_tx,
        }
    }

    fn reject(&self) -> anyhow::Error {
        CollabError::SandboxUnavailable {
            reason: self.reason.clone(),
        }
        .into()
    }
}

#[async_trait::async_trait]
impl SandboxRuntime for UnavailableSandbox {
    fn unavailable_reason(&self) -> Option<String> {
        Some(self.reason.clone())
    }

    async fn mount(&self, _tree: &FileTree) -> Result<()> {
        Err(self.reject())
    }

    async fn spawn(&self, _command: &[String]) -> Result<SandboxProcess> {
        Err(self.reject())
    }

    fn subscribe_ready(&self) -> broadcast::Receiver<PreviewAddress> {
        self.ready_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_operation_rejects_with_reason() {
        let sandbox = UnavailableSandbox::new("no runtime on this host");
        assert_eq!(
            sandbox.unavailable_reason().as_deref(),
            Some("no runtime on this host")
        );

        for err in [
            sandbox.mount(&FileTree::new()).await.unwrap_err(),
            sandbox.spawn(&["npm".into()]).await.unwrap_err(),
        ] {
            match err.downcast_ref::<CollabError>() {
                Some(CollabError::SandboxUnavailable { reason }) => {
                    assert_eq!(reason, "no runtime on this host")
                }
                other => panic!("unexpected error: {:?}", other),
            }
        }
    }
}
