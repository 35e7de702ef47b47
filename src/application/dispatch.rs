//! Per-token dispatch
//!
//! Each token gets a worker task fed by its own queue, so jobs for one
//! token run strictly in the order they were dispatched while different
//! tokens proceed in parallel. Idle workers exit; a replacement worker for
//! the same token waits for its predecessor before taking new jobs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::Address;
use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::SendError, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default time a worker waits for a new job before exiting
pub const DEFAULT_WORKER_IDLE_SECS: u64 = 60;

/// Work item for a single token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenJob {
    Launch { pair: Address },
    PriceSample,
    Graduated { agent_token: Address },
    /// Make sure a held position has its activity subscription
    EnsureSubscription,
}

#[async_trait]
pub trait TokenJobHandler: Send + Sync + 'static {
    async fn handle(&self, token: Address, job: TokenJob);
}

struct Worker {
    tx: UnboundedSender<TokenJob>,
    handle: JoinHandle<()>,
}

pub struct TokenDispatcher {
    handler: Arc<dyn TokenJobHandler>,
    workers: HashMap<Address, Worker>,
    idle_timeout: Duration,
}

impl TokenDispatcher {
    pub fn new(handler: Arc<dyn TokenJobHandler>, idle_timeout: Duration) -> Self {
        Self {
            handler,
            workers: HashMap::new(),
            idle_timeout,
        }
    }

    /// Queue `job` behind everything already queued for `token`
    pub fn dispatch(&mut self, token: Address, job: TokenJob) {
        let mut previous = None;

        if let Some(worker) = self.workers.remove(&token) {
            match worker.tx.send(job) {
                Ok(()) => {
                    self.workers.insert(token, worker);
                    return;
                }
                // Worker closed its queue on idle; chain a new one behind it
                Err(SendError(_)) => previous = Some(worker.handle),
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        // Receiver is alive, cannot fail
        let _ = tx.send(job);
        let handle = tokio::spawn(run_worker(
            token,
            self.handler.clone(),
            rx,
            previous,
            self.idle_timeout,
        ));
        self.workers.insert(token, Worker { tx, handle });
    }

    /// Forget workers that have exited
    pub fn prune(&mut self) -> usize {
        let before = self.workers.len();
        self.workers.retain(|_, worker| !worker.handle.is_finished());
        before - self.workers.len()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Close every queue and wait for workers to drain
    pub async fn shutdown(self) {
        let handles: Vec<JoinHandle<()>> = self
            .workers
            .into_values()
            .map(|worker| {
                drop(worker.tx);
                worker.handle
            })
            .collect();

        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Token worker ended abnormally: {}", e);
            }
        }
    }
}

async fn run_worker(
    token: Address,
    handler: Arc<dyn TokenJobHandler>,
    mut rx: UnboundedReceiver<TokenJob>,
    previous: Option<JoinHandle<()>>,
    idle_timeout: Duration,
) {
    if let Some(previous) = previous {
        if let Err(e) = previous.await {
            warn!("Previous worker for {} ended abnormally: {}", token, e);
        }
    }

    loop {
        match tokio::time::timeout(idle_timeout, rx.recv()).await {
            Ok(Some(job)) => handler.handle(token, job).await,
            Ok(None) => break,
            Err(_) => {
                // Refuse new jobs, then finish what already arrived
                rx.close();
                while let Some(job) = rx.recv().await {
                    handler.handle(token, job).await;
                }
                debug!("Worker for {} idle, exiting", token);
                break;
            }
        }
    }
}
