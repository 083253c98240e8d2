use std::sync::Arc;
use std::time::Duration;

use devserve_core::OwnerId;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::broadcast::Broadcaster;
use crate::event::LogEvent;

/// Spawn a task that forwards each line of `reader` to the owner's log.
///
/// Bytes are decoded lossily so invalid UTF-8 never stops the stream. Lines
/// are trimmed of trailing whitespace and blank lines are skipped. A read
/// error is reported once as an error event and ends this stream only.
pub fn spawn_stream_reader<R>(
    owner: OwnerId,
    reader: R,
    is_stderr: bool,
    broadcaster: Arc<Broadcaster>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let stream = if is_stderr { "stderr" } else { "stdout" };
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => {
                    debug!("{} of {} reached EOF", stream, owner);
                    break;
                }
                Ok(_) => {
                    let decoded = String::from_utf8_lossy(&buf);
                    let line = decoded.trim_end();
                    if line.is_empty() {
                        continue;
                    }
                    broadcaster
                        .append(&owner, LogEvent::output(line, is_stderr))
                        .await;
                }
                Err(e) => {
                    warn!("Error reading {} of {}: {}", stream, owner, e);
                    broadcaster
                        .append(
                            &owner,
                            LogEvent::error(format!("Failed to read {stream}: {e}")),
                        )
                        .await;
                    break;
                }
            }
        }
    })
}

/// Readers draining a running child's stdout and stderr.
#[derive(Debug, Default)]
pub struct OutputPump {
    readers: Vec<JoinHandle<()>>,
}

impl OutputPump {
    /// Start forwarding whichever of the two streams are present.
    pub fn new(
        owner: &OwnerId,
        stdout: Option<ChildStdout>,
        stderr: Option<ChildStderr>,
        broadcaster: &Arc<Broadcaster>,
    ) -> Self {
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = stdout {
            readers.push(spawn_stream_reader(
                owner.clone(),
                stdout,
                false,
                broadcaster.clone(),
            ));
        }
        if let Some(stderr) = stderr {
            readers.push(spawn_stream_reader(
                owner.clone(),
                stderr,
                true,
                broadcaster.clone(),
            ));
        }
        Self { readers }
    }

    /// Take the child's piped streams and start forwarding them.
    pub fn attach(owner: &OwnerId, child: &mut Child, broadcaster: &Arc<Broadcaster>) -> Self {
        Self::new(owner, child.stdout.take(), child.stderr.take(), broadcaster)
    }

    /// Wait for buffered output to be forwarded, abandoning readers that are
    /// still busy after `timeout`.
    pub async fn drain(self, timeout: Duration) {
        for mut reader in self.readers {
            if tokio::time::timeout(timeout, &mut reader).await.is_err() {
                debug!("Output reader still running after {:?}, aborting", timeout);
                reader.abort();
            }
        }
    }

    /// Stop forwarding immediately.
    pub fn abort(self) {
        for reader in self.readers {
            reader.abort();
        }
    }
}
