//! Serialized record sink.
//!
//! Producers block when the channel is full (records are never dropped); a
//! single writer task owns the output handle and flushes each record before
//! starting the next, so records are delivered atomically in channel order.

use std::path::Path;

use anyhow::Context as _;
use tokio::io::{AsyncWrite, AsyncWriteExt as _};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub struct Printer {
    tx: mpsc::Sender<String>,
    writer: JoinHandle<()>,
}

/// Cloneable handle given to the connection handlers.
#[derive(Clone)]
pub struct RecordSender(mpsc::Sender<String>);

#[cfg(test)]
impl RecordSender {
    /// Sender wired to nothing, for filter-evaluation tests.
    pub(crate) fn test_stub() -> Self {
        Self(mpsc::channel(1).0)
    }
}

impl RecordSender {
    /// Queue one record, waiting when the sink is saturated.
    pub async fn send(&self, record: String) {
        if self.0.send(record).await.is_err() {
            warn!("Output sink is gone, record dropped");
        }
    }
}

impl Printer {
    /// Write records to `path`, or stdout when `None`.
    pub async fn new(path: Option<&Path>, depth: usize) -> anyhow::Result<Self> {
        let output: Box<dyn AsyncWrite + Unpin + Send> = match path {
            Some(path) => {
                let file = tokio::fs::File::create(path)
                    .await
                    .with_context(|| format!("couldn't create output file `{}`", path.display()))?;
                Box::new(file)
            }
            None => Box::new(tokio::io::stdout()),
        };

        Ok(Self::with_writer(output, depth))
    }

    pub fn with_writer(output: Box<dyn AsyncWrite + Unpin + Send>, depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(depth.max(1));
        let writer = tokio::spawn(writer_task(rx, output));
        Self { tx, writer }
    }

    pub fn sender(&self) -> RecordSender {
        RecordSender(self.tx.clone())
    }

    /// Close the channel, wait for the writer to drain and flush.
    pub async fn finish(self) {
        let Self { tx, writer } = self;
        drop(tx);
        if writer.await.is_err() {
            warn!("Output writer task failed");
        }
    }
}

async fn writer_task(mut rx: mpsc::Receiver<String>, mut output: Box<dyn AsyncWrite + Unpin + Send>) {
    debug!("Output writer task started");

    while let Some(record) = rx.recv().await {
        if let Err(error) = output.write_all(record.as_bytes()).await {
            warn!(%error, "Failed to write record");
            continue;
        }
        if let Err(error) = output.flush().await {
            warn!(%error, "Failed to flush output");
        }
    }

    let _ = output.shutdown().await;

    debug!("Output writer task terminated");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt as _;

    #[tokio::test]
    async fn records_are_written_in_send_order() {
        let (write_half, mut read_half) = tokio::io::duplex(64 * 1024);
        let printer = Printer::with_writer(Box::new(write_half), 8);
        let sender = printer.sender();

        for i in 0..20 {
            sender.send(format!("record {i}\n")).await;
        }
        printer.finish().await;

        let mut collected = String::new();
        read_half.read_to_string(&mut collected).await.unwrap();

        let expected: String = (0..20).map(|i| format!("record {i}\n")).collect();
        assert_eq!(collected, expected);
    }

    #[tokio::test]
    async fn finish_flushes_pending_records() {
        let (write_half, mut read_half) = tokio::io::duplex(64 * 1024);
        let printer = Printer::with_writer(Box::new(write_half), 1);
        let sender = printer.sender();

        sender.send("last words\n".to_owned()).await;
        printer.finish().await;

        let mut collected = String::new();
        read_half.read_to_string(&mut collected).await.unwrap();
        assert_eq!(collected, "last words\n");
    }
}
