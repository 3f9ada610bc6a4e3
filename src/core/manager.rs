use crate::core::emitter::EventEmitter;
use crate::core::model::{DownloadRequest, TransferContext};
use crate::core::worker::TransferWorker;
use crate::protocol::{decode_command, Command, Event};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Sessions transferring at once; accepted requests beyond this queue.
    pub concurrency: usize,
    pub transfer: TransferContext,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self { concurrency: 6, transfer: TransferContext::default() }
    }
}

/// Hosts the command intake loop and the worker set. Reads one command per
/// line until the inbound channel closes, then drains: every accepted
/// session reaches its terminal event before `run` returns.
pub struct Manager {
    cfg: ManagerConfig,
    client: reqwest::Client,
    emitter: EventEmitter,
    gate: Arc<Semaphore>,
    cancels: Arc<Mutex<HashMap<i64, CancellationToken>>>,
}

impl Manager {
    pub fn new(
        cfg: ManagerConfig,
        out: impl AsyncWrite + Send + Unpin + 'static,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .user_agent(cfg.transfer.user_agent.clone())
            .build()?;
        let gate = Arc::new(Semaphore::new(cfg.concurrency.max(1)));
        Ok(Self {
            cfg,
            client,
            emitter: EventEmitter::new(out),
            gate,
            cancels: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub async fn run<R: AsyncBufRead + Unpin>(&self, input: R) -> anyhow::Result<()> {
        tracing::info!(concurrency = self.cfg.concurrency, "manager running");

        let mut lines = input.lines();
        let mut workers = JoinSet::new();
        let mut next_index: i64 = 0;

        while let Some(line) = lines.next_line().await? {
            // Reap finished workers so the set does not grow with history.
            while workers.try_join_next().is_some() {}

            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match decode_command(line) {
                Ok(Command::Download { url, path }) => match DownloadRequest::validate(&url, &path)
                {
                    Ok(request) => {
                        let index = next_index;
                        next_index += 1;
                        self.spawn_worker(&mut workers, index, request).await;
                    }
                    Err(e) => self.reject(format!("rejected request: {e}")).await,
                },
                Ok(Command::Cancel { cancel }) => {
                    let cancels = self.cancels.lock().await;
                    match cancels.get(&cancel) {
                        Some(token) => {
                            tracing::info!(index = cancel, "cancelling session");
                            token.cancel();
                        }
                        // Already finished or never existed; nothing to do.
                        None => tracing::debug!(index = cancel, "cancel for unknown session"),
                    }
                }
                Err(e) => self.reject(format!("invalid request line: {e}")).await,
            }
        }

        tracing::info!(outstanding = workers.len(), "input closed, draining");
        while let Some(joined) = workers.join_next().await {
            // Worker panics are caught inside run(); anything surfacing here
            // is a runtime-level cancellation.
            if let Err(e) = joined {
                tracing::error!(error = %e, "worker task aborted");
            }
        }
        tracing::info!("manager stopped");
        Ok(())
    }

    async fn spawn_worker(
        &self,
        workers: &mut JoinSet<()>,
        index: i64,
        request: DownloadRequest,
    ) {
        tracing::info!(index, url = %request.url, path = %request.path.display(), "accepted download");

        let token = CancellationToken::new();
        self.cancels.lock().await.insert(index, token.clone());

        let worker = TransferWorker::new(
            self.client.clone(),
            self.cfg.transfer.clone(),
            self.emitter.clone(),
            token,
            index,
            request,
        );
        let gate = self.gate.clone();
        let cancels = self.cancels.clone();
        // Fire-and-forget: the intake loop never waits on this.
        workers.spawn(async move {
            worker.run(gate).await;
            cancels.lock().await.remove(&index);
        });
    }

    async fn reject(&self, message: String) {
        tracing::warn!(%message);
        if let Err(e) = self.emitter.emit(&Event::rejected(message)).await {
            tracing::warn!(error = %e, "validation event lost");
        }
    }
}
