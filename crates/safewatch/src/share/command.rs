//! Native share backend that hands text to an external program.
//!
//! On desktops the "share sheet" is whatever the user configures: a messaging
//! CLI, `notify-send`, a script that mails the contacts. The text is written to
//! the program's stdin and a zero exit status counts as delivered.

use std::io::ErrorKind;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{ShareBackend, ShareError};

/// Pipes the message into a configured command.
#[derive(Debug, Clone, Default)]
pub struct CommandShare {
    argv: Vec<String>,
}

impl CommandShare {
    /// Create a backend from a program and its arguments. An empty `argv`
    /// yields a backend that is always unavailable.
    #[must_use]
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }

    /// Whether a program is configured.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        !self.argv.is_empty()
    }
}

#[async_trait::async_trait]
impl ShareBackend for CommandShare {
    async fn share(&self, text: &str) -> Result<(), ShareError> {
        let Some((program, args)) = self.argv.split_first() else {
            return Err(ShareError::Unavailable(
                "no share command configured".to_string(),
            ));
        };

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => ShareError::Unavailable(format!("{program}: {e}")),
                ErrorKind::PermissionDenied => {
                    ShareError::PermissionDenied(format!("{program}: {e}"))
                }
                _ => ShareError::Failed(format!("{program}: {e}")),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(text.as_bytes()).await {
                // The program may exit without reading; its status decides.
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {}
                Err(e) => return Err(ShareError::Failed(format!("writing to {program}: {e}"))),
                Ok(()) => {}
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| ShareError::Failed(format!("waiting for {program}: {e}")))?;

        debug!(program = %program, %status, "Share command finished");
        if status.success() {
            Ok(())
        } else {
            Err(ShareError::Rejected(format!("{program} exited with {status}")))
        }
    }

    fn name(&self) -> &'static str {
        "command"
    }
}
