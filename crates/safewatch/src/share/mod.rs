//! Outbound distribution of alert text.
//!
//! A [`ShareChannel`] is a three-tier chain: the native share backend, then the
//! clipboard, then handing the raw text back for manual display. Every call to
//! [`ShareChannel::send`] resolves to exactly one [`ShareOutcome`]; the chain
//! itself never fails.

mod clipboard;
mod command;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

pub use clipboard::SystemClipboard;
pub use command::CommandShare;

/// Default bound on a single backend attempt.
pub const DEFAULT_SHARE_TIMEOUT: Duration = Duration::from_secs(15);

/// Errors a single share backend can report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShareError {
    /// The backend is not available on this system.
    #[error("share backend unavailable: {0}")]
    Unavailable(String),

    /// The user dismissed the share sheet or the target refused the text.
    #[error("share rejected: {0}")]
    Rejected(String),

    /// The platform denied access (for example clipboard access).
    #[error("share permission denied: {0}")]
    PermissionDenied(String),

    /// The backend did not finish within the attempt timeout.
    #[error("share attempt timed out after {0:?}")]
    TimedOut(Duration),

    /// Any other backend failure.
    #[error("share failed: {0}")]
    Failed(String),
}

/// A single way of delivering text to the outside world.
#[async_trait::async_trait]
pub trait ShareBackend: Send + Sync + fmt::Debug {
    /// Deliver the text.
    async fn share(&self, text: &str) -> Result<(), ShareError>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// How a message left the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareOutcome {
    /// The native share backend accepted the text.
    DeliveredNative,
    /// The text was placed on the clipboard.
    DeliveredClipboard,
    /// Nothing worked; the caller must show the text to the user.
    ManualDisplay {
        /// The undelivered text.
        text: String,
    },
}

impl ShareOutcome {
    /// Whether a backend took the text.
    #[must_use]
    pub fn is_delivered(&self) -> bool {
        !matches!(self, Self::ManualDisplay { .. })
    }

    /// Short label for logs and status output.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::DeliveredNative => "native",
            Self::DeliveredClipboard => "clipboard",
            Self::ManualDisplay { .. } => "manual",
        }
    }
}

/// The native, clipboard, manual fallback chain.
#[derive(Debug, Clone)]
pub struct ShareChannel {
    native: Option<Arc<dyn ShareBackend>>,
    clipboard: Option<Arc<dyn ShareBackend>>,
    attempt_timeout: Duration,
}

impl Default for ShareChannel {
    fn default() -> Self {
        Self::manual_only()
    }
}

impl ShareChannel {
    /// Create a chain from optional backends.
    #[must_use]
    pub fn new(
        native: Option<Arc<dyn ShareBackend>>,
        clipboard: Option<Arc<dyn ShareBackend>>,
    ) -> Self {
        Self {
            native,
            clipboard,
            attempt_timeout: DEFAULT_SHARE_TIMEOUT,
        }
    }

    /// A chain with no backends; every send returns the text for display.
    #[must_use]
    pub fn manual_only() -> Self {
        Self::new(None, None)
    }

    /// Override the per-attempt timeout.
    #[must_use]
    pub fn with_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    /// Deliver text through the first tier that accepts it.
    pub async fn send(&self, text: &str) -> ShareOutcome {
        if let Some(native) = &self.native {
            match self.attempt(native.as_ref(), text).await {
                Ok(()) => return delivered(ShareOutcome::DeliveredNative),
                Err(e) => warn!(backend = native.name(), error = %e, "Native share failed, falling back"),
            }
        }

        if let Some(clipboard) = &self.clipboard {
            match self.attempt(clipboard.as_ref(), text).await {
                Ok(()) => return delivered(ShareOutcome::DeliveredClipboard),
                Err(e) => warn!(backend = clipboard.name(), error = %e, "Clipboard fallback failed"),
            }
        }

        warn!(
            outcome = "manual",
            "No share backend delivered the message; returning it for manual display"
        );
        ShareOutcome::ManualDisplay {
            text: text.to_string(),
        }
    }

    async fn attempt(&self, backend: &dyn ShareBackend, text: &str) -> Result<(), ShareError> {
        debug!(backend = backend.name(), len = text.len(), "Attempting share");
        tokio::time::timeout(self.attempt_timeout, backend.share(text))
            .await
            .map_err(|_| ShareError::TimedOut(self.attempt_timeout))?
    }
}

fn delivered(outcome: ShareOutcome) -> ShareOutcome {
    info!(outcome = outcome.label(), "Message shared");
    outcome
}
