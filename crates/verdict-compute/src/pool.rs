//! Pool-of-inner-computes.
//!
//! Wraps any inner compute flavor by sharding whole `audit_page` /
//! `authorize` invocations to a pool of worker tasks. Each worker owns its
//! own started inner compute and storage handle; requests share nothing
//! but the queue.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use verdict_kernel::SearchFn;
use verdict_store_core::GrantStore;
use verdict_types::{
    AuditPage, AuthorizeResponse, IdentityDefinition, ModuleLocality, Request,
    ResourceDefinition, Result, SdkError,
};

use crate::ComputeBackend;

/// Builds one inner compute per pool worker.
pub type ComputeFactory = Arc<dyn Fn() -> Box<dyn ComputeBackend> + Send + Sync>;

enum Job {
    Audit {
        request: Request,
        page_ref: Option<String>,
        grants_page_size: usize,
        parallel_paging: bool,
        refs_page_size: usize,
        reply: oneshot::Sender<Result<AuditPage>>,
    },
    Authorize {
        request: Request,
        grants_page_size: usize,
        parallel_paging: bool,
        refs_page_size: usize,
        reply: oneshot::Sender<Result<AuthorizeResponse>>,
    },
}

struct PoolState {
    tx: mpsc::Sender<Job>,
    handles: Vec<JoinHandle<()>>,
}

/// Compute that dispatches whole invocations to a fixed pool of workers.
///
/// Throughput-oriented: each request is served by a single worker's inner
/// compute, so many requests make progress concurrently.
pub struct PoolCompute {
    workers: usize,
    factory: ComputeFactory,
    state: RwLock<Option<PoolState>>,
}

impl PoolCompute {
    /// Create a pool of `workers` inner computes built by `factory`.
    pub fn new(workers: usize, factory: ComputeFactory) -> Self {
        Self {
            workers: workers.max(1),
            factory,
            state: RwLock::new(None),
        }
    }

    async fn sender(&self) -> Result<mpsc::Sender<Job>> {
        let state = self.state.read().await;
        state
            .as_ref()
            .map(|s| s.tx.clone())
            .ok_or_else(|| SdkError::Start("the compute module has not been started".into()).into())
    }
}

async fn worker_loop(worker_id: usize, inner: Box<dyn ComputeBackend>, rx: Arc<Mutex<mpsc::Receiver<Job>>>) {
    loop {
        let job = { rx.lock().await.recv().await };
        let Some(job) = job else { break };
        match job {
            Job::Audit {
                request,
                page_ref,
                grants_page_size,
                parallel_paging,
                refs_page_size,
                reply,
            } => {
                debug!(worker_id, "processing audit page");
                let result = inner
                    .audit_page(
                        &request,
                        page_ref.as_deref(),
                        grants_page_size,
                        parallel_paging,
                        refs_page_size,
                    )
                    .await;
                let _ = reply.send(result);
            }
            Job::Authorize {
                request,
                grants_page_size,
                parallel_paging,
                refs_page_size,
                reply,
            } => {
                debug!(worker_id, "processing authorize");
                let result = inner
                    .authorize(&request, grants_page_size, parallel_paging, refs_page_size)
                    .await;
                let _ = reply.send(result);
            }
        }
    }
    if let Err(e) = inner.shutdown().await {
        warn!(worker_id, error = %e, "inner compute shutdown failed");
    }
}

#[async_trait]
impl ComputeBackend for PoolCompute {
    async fn start(
        &self,
        identity_defs: &[IdentityDefinition],
        resource_defs: &[ResourceDefinition],
        search: SearchFn,
        storage: Arc<dyn GrantStore>,
    ) -> Result<()> {
        let (tx, rx) = mpsc::channel::<Job>(self.workers * 2);
        let rx = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(self.workers);
        for worker_id in 0..self.workers {
            let inner = (self.factory)();
            inner
                .start(identity_defs, resource_defs, search.clone(), storage.clone())
                .await?;
            handles.push(tokio::spawn(worker_loop(worker_id, inner, rx.clone())));
        }
        debug!(workers = self.workers, "compute pool started");

        *self.state.write().await = Some(PoolState { tx, handles });
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let state = self.state.write().await.take();
        if let Some(PoolState { tx, handles }) = state {
            drop(tx);
            for handle in handles {
                handle
                    .await
                    .map_err(|e| SdkError::Worker(e.to_string()))?;
            }
        }
        Ok(())
    }

    fn locality(&self) -> ModuleLocality {
        ModuleLocality::Process
    }

    async fn audit_page(
        &self,
        request: &Request,
        page_ref: Option<&str>,
        grants_page_size: usize,
        parallel_paging: bool,
        refs_page_size: usize,
    ) -> Result<AuditPage> {
        let tx = self.sender().await?;
        let (reply, response) = oneshot::channel();
        tx.send(Job::Audit {
            request: request.clone(),
            page_ref: page_ref.map(String::from),
            grants_page_size,
            parallel_paging,
            refs_page_size,
            reply,
        })
        .await
        .map_err(|e| SdkError::Worker(e.to_string()))?;
        response
            .await
            .map_err(|e| SdkError::Worker(e.to_string()))?
    }

    async fn authorize(
        &self,
        request: &Request,
        grants_page_size: usize,
        parallel_paging: bool,
        refs_page_size: usize,
    ) -> Result<AuthorizeResponse> {
        let tx = self.sender().await?;
        let (reply, response) = oneshot::channel();
        tx.send(Job::Authorize {
            request: request.clone(),
            grants_page_size,
            parallel_paging,
            refs_page_size,
            reply,
        })
        .await
        .map_err(|e| SdkError::Worker(e.to_string()))?;
        response
            .await
            .map_err(|e| SdkError::Worker(e.to_string()))?
    }
}
