use crate::core::emitter::EventEmitter;
use crate::core::model::{DownloadRequest, DownloadSession, SessionState, TransferContext};
use crate::protocol::Event;
use bytes::Bytes;
use futures::FutureExt;
use reqwest::StatusCode;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;

#[derive(thiserror::Error, Debug)]
pub enum TransferError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("http status {0}")]
    Status(StatusCode),

    #[error("timed out waiting for response headers")]
    HeaderTimeout,

    #[error("open {path}: {source}")]
    Open { path: String, source: std::io::Error },

    #[error("write {path}: {source}")]
    Write { path: String, source: std::io::Error },

    #[error("cancelled")]
    Cancelled,
}

/// One worker per accepted session. Owns its file handle and connection
/// exclusively, streams the body chunk by chunk, and ends its event sequence
/// with exactly one terminal event no matter how the transfer goes.
pub struct TransferWorker {
    client: reqwest::Client,
    ctx: TransferContext,
    emitter: EventEmitter,
    cancel: CancellationToken,
    session: DownloadSession,
}

impl TransferWorker {
    pub fn new(
        client: reqwest::Client,
        ctx: TransferContext,
        emitter: EventEmitter,
        cancel: CancellationToken,
        index: i64,
        request: DownloadRequest,
    ) -> Self {
        Self { client, ctx, emitter, cancel, session: DownloadSession::new(index, request) }
    }

    /// Waits for a slot on `gate`, runs the transfer, emits the terminal
    /// event. A panic escaping the transfer is caught here so the session
    /// still terminates observably instead of going silently stuck.
    pub async fn run(mut self, gate: Arc<Semaphore>) {
        let index = self.session.index;

        let _permit = tokio::select! {
            _ = self.cancel.cancelled() => {
                self.session.state = SessionState::Cancelled;
                self.finish(Event::cancelled(index)).await;
                return;
            }
            permit = gate.acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => {
                    self.session.state = SessionState::Failed;
                    self.finish(Event::failed(index, "worker pool shut down")).await;
                    return;
                }
            },
        };

        let outcome = AssertUnwindSafe(self.transfer()).catch_unwind().await;
        let terminal = match outcome {
            Ok(Ok(())) => {
                self.session.state = SessionState::Completed;
                Event::completed(index)
            }
            Ok(Err(TransferError::Cancelled)) => {
                self.session.state = SessionState::Cancelled;
                Event::cancelled(index)
            }
            Ok(Err(e)) => {
                self.session.state = SessionState::Failed;
                tracing::warn!(index, error = %e, "transfer failed");
                Event::failed(index, e.to_string())
            }
            Err(panic) => {
                self.session.state = SessionState::Failed;
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(index, panic = %msg, "worker panicked");
                Event::failed(index, format!("worker panicked: {msg}"))
            }
        };
        self.finish(terminal).await;
    }

    async fn finish(&self, terminal: Event) {
        tracing::debug!(
            index = self.session.index,
            state = ?self.session.state,
            bytes = self.session.bytes_downloaded,
            "session finished"
        );
        if let Err(e) = self.emitter.emit(&terminal).await {
            tracing::warn!(index = self.session.index, error = %e, "terminal event lost");
        }
    }

    async fn transfer(&mut self) -> Result<(), TransferError> {
        let mut resp = self.initiate().await?;
        self.session.total_bytes = resp.content_length().unwrap_or(0);
        self.session.state = SessionState::InProgress;
        tracing::debug!(
            index = self.session.index,
            total = self.session.total_bytes,
            "response headers received"
        );

        let path = self.session.request.path.clone();
        let display = path.display().to_string();
        // File handle is exclusively ours until the terminal event; a failed
        // open is the same error path as any mid-transfer fault.
        let mut file = File::create(&path)
            .await
            .map_err(|source| TransferError::Open { path: display.clone(), source })?;

        let streamed = self.stream_body(&mut resp, &mut file, &display).await;

        // Release the handle before the terminal event regardless of outcome.
        // A partially written file is left as-is on the error path.
        let flushed = file.flush().await;
        drop(file);
        drop(resp);
        streamed?;
        flushed.map_err(|source| TransferError::Write { path: display, source })?;
        Ok(())
    }

    /// Sends the GET, retrying connect failures and retryable statuses with
    /// exponential backoff. Anything else is surfaced to the caller as the
    /// terminal error.
    ///
    /// `timeout_secs` bounds header arrival only. A started transfer has no
    /// deadline: however long the body takes, the worker runs to its
    /// terminal state (only cancellation can stop it).
    async fn initiate(&self) -> Result<reqwest::Response, TransferError> {
        let mut last_err: Option<TransferError> = None;
        for attempt in 0..=self.ctx.retries {
            if attempt > 0 {
                self.sleep_backoff(attempt - 1).await?;
            }

            let send = timeout(
                Duration::from_secs(self.ctx.timeout_secs),
                self.client.get(self.session.request.url.clone()).send(),
            );
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                r = send => r,
            };

            match result {
                Err(_) => {
                    last_err = Some(TransferError::HeaderTimeout);
                }
                Ok(Ok(resp)) if resp.status().is_success() => return Ok(resp),
                Ok(Ok(resp)) if should_retry_status(resp.status()) => {
                    last_err = Some(TransferError::Status(resp.status()));
                }
                Ok(Ok(resp)) => return Err(TransferError::Status(resp.status())),
                Ok(Err(e)) if e.is_connect() || e.is_timeout() => {
                    last_err = Some(TransferError::Request(e));
                }
                Ok(Err(e)) => return Err(TransferError::Request(e)),
            }
        }
        Err(last_err.unwrap_or(TransferError::HeaderTimeout))
    }

    async fn stream_body(
        &mut self,
        resp: &mut reqwest::Response,
        file: &mut File,
        display: &str,
    ) -> Result<(), TransferError> {
        let index = self.session.index;
        let mut since_emit = 0u64;
        loop {
            let chunk: Option<Bytes> = tokio::select! {
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                c = resp.chunk() => c?,
            };
            let Some(chunk) = chunk else { break };

            file.write_all(&chunk)
                .await
                .map_err(|source| TransferError::Write { path: display.to_string(), source })?;

            self.session.bytes_downloaded += chunk.len() as u64;
            since_emit += chunk.len() as u64;
            if since_emit >= self.ctx.chunk_size {
                since_emit = 0;
                let event = Event::progress(index, self.session.percent());
                if let Err(e) = self.emitter.emit(&event).await {
                    tracing::debug!(index, error = %e, "progress event lost");
                }
            }
        }
        Ok(())
    }

    async fn sleep_backoff(&self, attempt: u32) -> Result<(), TransferError> {
        let base = self.ctx.retry_backoff_ms.max(1);
        let mul = 1u64 << attempt.min(16);
        let ms = base.saturating_mul(mul).min(30_000);
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TransferError::Cancelled),
            _ = sleep(Duration::from_millis(ms)) => Ok(()),
        }
    }
}

fn should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}
