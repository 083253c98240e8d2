//! Newline-delimited frames over the process's standard streams.

use futures::{Sink, Stream, StreamExt};
use std::io::{self, BufRead};
use std::pin::Pin;
use tokio::io::AsyncWriteExt;

pub type Frames = Pin<Box<dyn Stream<Item = String> + Send>>;
pub type FrameSink = Pin<Box<dyn Sink<String, Error = io::Error> + Send>>;

/// Lines read from stdin. The stream stays open after stdin closes so a
/// detached run keeps streaming.
///
/// Reads happen on a plain thread: a blocking stdin read cannot be cancelled
/// and would otherwise hold up runtime shutdown.
pub fn stdin_frames() -> Frames {
    let (tx, rx) = futures::channel::mpsc::unbounded();
    std::thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.unbounded_send(line).is_err() {
                break;
            }
        }
    });
    Box::pin(rx.chain(futures::stream::pending()))
}

/// Writes each frame to stdout as one line.
pub fn stdout_frames() -> FrameSink {
    Box::pin(futures::sink::unfold(
        tokio::io::stdout(),
        |mut stdout, frame: String| async move {
            stdout.write_all(frame.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
            Ok::<_, io::Error>(stdout)
        },
    ))
}
