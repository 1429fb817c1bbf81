use std::time::Duration;

use futures::StreamExt;
use policy_agent_api::{Message, codec};
use tokio::net::UnixStream;
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const MESSAGE_BUFFER: usize = 64;

pub(crate) type Decoded = Result<Message, policy_agent_api::Error>;

/// A policy engine connection. Frames are decoded on a separate task and
/// handed over in arrival order; the reader never touches agent state.
pub(crate) struct Connection {
    messages: mpsc::Receiver<Decoded>,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
}

impl Connection {
    pub fn spawn(stream: UnixStream) -> Self {
        let (tx, messages) = mpsc::channel(MESSAGE_BUFFER);
        let cancel = CancellationToken::new();
        let reader = tokio::spawn(read_messages(stream, tx, cancel.clone()));
        Self {
            messages,
            cancel,
            reader,
        }
    }

    /// Next decoded message, `None` once the reader stopped.
    pub async fn next(&mut self) -> Option<Decoded> {
        self.messages.recv().await
    }

    /// Stops the reader, which closes the socket. The reader is aborted if
    /// it does not stop within `timeout`.
    pub async fn close(self, timeout: Duration) {
        self.cancel.cancel();
        let mut reader = self.reader;
        match tokio::time::timeout(timeout, &mut reader).await {
            Ok(Ok(())) => debug!("connection closed"),
            Ok(Err(e)) => warn!("connection reader failed: {e}"),
            Err(_) => {
                warn!(?timeout, "connection reader did not stop, aborting");
                reader.abort();
            }
        }
    }
}

async fn read_messages(
    stream: UnixStream,
    tx: mpsc::Sender<Decoded>,
    cancel: CancellationToken,
) {
    let mut frames = FramedRead::new(stream, codec::codec());
    loop {
        let frame = select! {
            _ = cancel.cancelled() => return,
            frame = frames.next() => frame,
        };
        let decoded = match frame {
            Some(Ok(frame)) => codec::decode(&frame),
            Some(Err(e)) => Err(e.into()),
            None => return,
        };
        // nothing after a broken frame can be trusted
        let last = decoded.is_err();
        select! {
            _ = cancel.cancelled() => return,
            sent = tx.send(decoded) => if sent.is_err() { return },
        }
        if last {
            return;
        }
    }
}
