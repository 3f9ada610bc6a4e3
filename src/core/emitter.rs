use crate::protocol::Event;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Shared sink for the outbound channel. Any number of workers may emit
/// concurrently; each event leaves as one complete newline-terminated line,
/// never interleaved with another. Serialization happens outside the lock so
/// the critical section is just the write and flush.
#[derive(Clone)]
pub struct EventEmitter {
    out: Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>,
}

impl EventEmitter {
    pub fn new(out: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self { out: Arc::new(Mutex::new(Box::new(out))) }
    }

    pub async fn emit(&self, event: &Event) -> std::io::Result<()> {
        let mut line = event.encode()?;
        line.push('\n');
        let mut out = self.out.lock().await;
        out.write_all(line.as_bytes()).await?;
        out.flush().await
    }
}
