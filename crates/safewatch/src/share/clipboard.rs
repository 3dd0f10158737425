//! System clipboard share backend.

use clipboard_rs::{Clipboard, ClipboardContext};
use tracing::trace;

use super::{ShareBackend, ShareError};

/// Places text on the system clipboard.
///
/// `clipboard-rs` is synchronous, so each write runs on the blocking pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClipboard;

impl SystemClipboard {
    /// Create the backend.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn write(text: &str) -> Result<(), ShareError> {
        let ctx = ClipboardContext::new().map_err(|e| ShareError::Unavailable(e.to_string()))?;

        ctx.set_text(text.to_string())
            .map_err(|e| ShareError::Failed(e.to_string()))?;

        // Some clipboard managers accept the write but keep the old content.
        match ctx.get_text() {
            Ok(current) if current == text => {
                trace!(len = text.len(), "Clipboard write confirmed");
                Ok(())
            }
            Ok(_) => Err(ShareError::Rejected(
                "clipboard content changed after write".to_string(),
            )),
            Err(e) => Err(ShareError::PermissionDenied(e.to_string())),
        }
    }
}

#[async_trait::async_trait]
impl ShareBackend for SystemClipboard {
    async fn share(&self, text: &str) -> Result<(), ShareError> {
        let text = text.to_string();
        tokio::task::spawn_blocking(move || Self::write(&text))
            .await
            .map_err(|e| ShareError::Failed(format!("clipboard task failed: {e}")))?
    }

    fn name(&self) -> &'static str {
        "clipboard"
    }
}
