//! Pre-warmed pool of execution contexts.
//!
//! `acquire` never blocks on pool exhaustion: it either pops a pre-warmed
//! context or synchronously creates one on demand (the degraded path), then
//! asynchronously refills the pool back to its target size. This trades a
//! cold-start latency spike for never stalling the orchestrator's step
//! loop, while amortizing container start cost under steady load.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info, instrument, warn};

use crate::context::ExecutionContext;
use crate::errors::SandboxError;
use crate::runtime::{ContainerLimits, ContainerRuntime};

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub image: String,
    pub target_size: usize,
    pub limits: ContainerLimits,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            image: "python:3.11-slim".into(),
            target_size: 2,
            limits: ContainerLimits::default(),
        }
    }
}

pub struct ContainerPool {
    runtime: Arc<dyn ContainerRuntime>,
    config: PoolConfig,
    pool: Mutex<Vec<ExecutionContext>>,
    initializing: AtomicBool,
}

impl ContainerPool {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: PoolConfig) -> Self {
        Self {
            runtime,
            config,
            pool: Mutex::new(Vec::new()),
            initializing: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Pooled context count.
    pub fn size(&self) -> usize {
        self.pool.lock().len()
    }

    /// Pre-warm the pool: ensure the base image is present, then fill to
    /// target size. Idempotent; failures are logged and stop the fill, so
    /// the pool may initialize short of target.
    #[instrument(skip(self))]
    pub async fn initialize(&self) {
        if self.initializing.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(target_size = self.config.target_size, "initializing container pool");
        if let Err(e) = self.runtime.ensure_image(&self.config.image).await {
            error!(error = %e, image = %self.config.image, "failed to initialize container pool");
        } else {
            self.replenish().await;
        }

        self.initializing.store(false, Ordering::SeqCst);
    }

    /// Hand out a context. Pops a pre-warmed one when available, otherwise
    /// creates on demand. Triggers asynchronous replenishment either way;
    /// replenishment failures are logged, never propagated.
    #[instrument(skip(self))]
    pub async fn acquire(self: &Arc<Self>) -> Result<ExecutionContext, SandboxError> {
        let pooled = self.pool.lock().pop();

        let context = match pooled {
            Some(ctx) => ctx,
            None => {
                warn!("container pool exhausted, creating context on demand");
                self.create_context().await?
            }
        };

        let pool = Arc::clone(self);
        drop(tokio::spawn(async move {
            pool.replenish().await;
        }));

        Ok(context)
    }

    /// Fill the pool up to target size. Stops at the first creation
    /// failure (e.g. container daemon down) rather than retrying forever.
    async fn replenish(&self) {
        while self.pool.lock().len() < self.config.target_size {
            match self.create_context().await {
                Ok(ctx) => self.pool.lock().push(ctx),
                Err(e) => {
                    error!(error = %e, "failed to replenish container pool");
                    break;
                }
            }
        }
    }

    async fn create_context(&self) -> Result<ExecutionContext, SandboxError> {
        let container_id = self
            .runtime
            .create_container(&self.config.image, &self.config.limits)
            .await?;
        Ok(ExecutionContext::new(container_id, Arc::clone(&self.runtime)))
    }

    /// Destroy every pooled context concurrently and empty the pool.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let contexts: Vec<ExecutionContext> = self.pool.lock().drain(..).collect();
        info!(count = contexts.len(), "shutting down container pool");

        let destroys = contexts.into_iter().map(|mut ctx| async move {
            if let Err(e) = ctx.destroy().await {
                error!(context = %ctx.id(), error = %e, "failed to destroy pooled context");
            }
        });
        futures::future::join_all(destroys).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeRuntime;

    fn make_pool(runtime: Arc<FakeRuntime>, target: usize) -> Arc<ContainerPool> {
        Arc::new(ContainerPool::new(
            runtime,
            PoolConfig {
                target_size: target,
                ..Default::default()
            },
        ))
    }

    #[tokio::test]
    async fn initialize_fills_to_target() {
        let runtime = Arc::new(FakeRuntime::new());
        let pool = make_pool(runtime.clone(), 3);

        pool.initialize().await;
        assert_eq!(pool.size(), 3);
        assert_eq!(runtime.created_count(), 3);
    }

    #[tokio::test]
    async fn initialize_short_on_create_failure() {
        let runtime = Arc::new(FakeRuntime::new());
        let pool = make_pool(runtime.clone(), 3);

        // The first create fails and the fill stops without throwing.
        runtime.fail_next_create();
        pool.initialize().await;
        assert_eq!(pool.size(), 0);

        // A later explicit initialize can still fill the pool.
        pool.initialize().await;
        assert_eq!(pool.size(), 3);
    }

    #[tokio::test]
    async fn initialize_logs_image_failure_without_panicking() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.fail_image();
        let pool = make_pool(runtime.clone(), 2);

        pool.initialize().await;
        assert_eq!(pool.size(), 0);
        assert_eq!(runtime.created_count(), 0);
    }

    #[tokio::test]
    async fn acquire_pops_prewarmed_context() {
        let runtime = Arc::new(FakeRuntime::new());
        let pool = make_pool(runtime.clone(), 2);
        pool.initialize().await;

        let ctx = pool.acquire().await.unwrap();
        assert!(ctx.container_id().starts_with("ctr-"));
    }

    #[tokio::test]
    async fn acquire_creates_on_demand_when_drained() {
        let runtime = Arc::new(FakeRuntime::new());
        let pool = make_pool(runtime.clone(), 0); // never pre-warms

        // Pool is empty; acquire must still return a usable context.
        let ctx = pool.acquire().await.unwrap();
        assert!(ctx.container_id().starts_with("ctr-"));
        assert_eq!(runtime.created_count(), 1);
    }

    #[tokio::test]
    async fn acquire_replenishes_in_background() {
        let runtime = Arc::new(FakeRuntime::new());
        let pool = make_pool(runtime.clone(), 2);
        pool.initialize().await;
        assert_eq!(pool.size(), 2);

        let _ctx = pool.acquire().await.unwrap();

        // Wait for the spawned replenishment to land.
        for _ in 0..50 {
            if pool.size() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(pool.size(), 2);
        assert_eq!(runtime.created_count(), 3);
    }

    #[tokio::test]
    async fn drained_pool_still_serves_sequential_acquires() {
        let runtime = Arc::new(FakeRuntime::new());
        let pool = make_pool(runtime.clone(), 1);
        pool.initialize().await;

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();
        assert_ne!(a.container_id(), b.container_id());
        assert_ne!(b.container_id(), c.container_id());
    }

    #[tokio::test]
    async fn shutdown_destroys_all_and_empties() {
        let runtime = Arc::new(FakeRuntime::new());
        let pool = make_pool(runtime.clone(), 3);
        pool.initialize().await;
        assert_eq!(pool.size(), 3);

        pool.shutdown().await;
        assert_eq!(pool.size(), 0);
        assert_eq!(runtime.removed().len(), 3);
    }

    #[tokio::test]
    async fn initialize_is_idempotent_under_reentry() {
        let runtime = Arc::new(FakeRuntime::new());
        let pool = make_pool(runtime.clone(), 2);

        pool.initialize().await;
        pool.initialize().await;
        assert_eq!(pool.size(), 2);
        assert_eq!(runtime.created_count(), 2);
    }
}
