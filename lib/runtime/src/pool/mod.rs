// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Fixed-size pool of isolated workers with enforced cancellation.
//!
//! Each slot holds one worker (a child process or a dedicated thread) that runs at most one
//! job at a time. Callers suspend in [`CancellablePool::apply`] until a slot frees up, in FIFO
//! order. When the caller cancels, or drops the future, the worker is terminated and a fresh
//! one takes its slot, so the slot count never shrinks. A job that fails normally reports its
//! error through the response and keeps its worker.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub mod process;
pub mod thread;

pub use process::{ProcessWorker, ProcessWorkerFactory, WorkerCommand};
pub use thread::{JobHandler, ThreadWorker, ThreadWorkerFactory};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("job was cancelled")]
    Cancelled,

    #[error("worker stopped while running the job: {0}")]
    WorkerLost(String),

    #[error("failed to start a worker: {0}")]
    Spawn(String),

    #[error("worker pool is shut down")]
    ShutDown,
}

/// One isolated execution unit.
#[async_trait]
pub trait PoolWorker: Send + 'static {
    type Request: Send + 'static;
    type Response: Send + 'static;

    /// Run one job. An `Err` means the worker itself is gone and must be replaced;
    /// failures of the job belong in `Response`.
    async fn call(&mut self, request: Self::Request) -> anyhow::Result<Self::Response>;

    /// Stop the worker: ask it to stop, wait up to `grace`, then force it.
    async fn terminate(self, grace: Duration);
}

/// Starts workers for a pool slot.
#[async_trait]
pub trait WorkerFactory: Send + Sync + 'static {
    type Worker: PoolWorker;

    async fn spawn(&self, slot: usize) -> anyhow::Result<Self::Worker>;
}

type Request<F> = <<F as WorkerFactory>::Worker as PoolWorker>::Request;
type Response<F> = <<F as WorkerFactory>::Worker as PoolWorker>::Response;

struct Slot<W> {
    id: usize,
    worker: W,
}

enum Vacancy<W> {
    Ready(Slot<W>),
    /// The replacement could not be started; retried on the next claim
    Empty(usize),
}

impl<W> Vacancy<W> {
    fn id(&self) -> usize {
        match self {
            Vacancy::Ready(slot) => slot.id,
            Vacancy::Empty(id) => *id,
        }
    }
}

struct FreeList<W> {
    vacancies: VecDeque<Vacancy<W>>,
    closed: bool,
}

struct PoolInner<F: WorkerFactory> {
    factory: F,
    size: usize,
    cancel_grace: Duration,
    free: Mutex<FreeList<F::Worker>>,
    // available permits == vacancies in the free list
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    handle: tokio::runtime::Handle,
}

/// A fixed-size, cancellable worker pool. Cloning shares the same pool.
pub struct CancellablePool<F: WorkerFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: WorkerFactory> Clone for CancellablePool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<F: WorkerFactory> std::fmt::Debug for CancellablePool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellablePool")
            .field("size", &self.inner.size)
            .field("available", &self.available())
            .field("shut_down", &self.inner.shutdown.is_cancelled())
            .finish()
    }
}

enum Outcome<R> {
    Finished(anyhow::Result<R>),
    Cancelled,
    ShutDown,
}

impl<F: WorkerFactory> CancellablePool<F> {
    /// Start `size` workers. Fails if any of them cannot be started.
    pub async fn new(factory: F, size: usize, cancel_grace: Duration) -> anyhow::Result<Self> {
        anyhow::ensure!(size > 0, "a worker pool needs at least one worker");

        let mut starting = Vec::with_capacity(size);
        for id in 0..size {
            starting.push(factory.spawn(id));
        }
        let spawned = join_all(starting).await;

        let mut ready = Vec::with_capacity(size);
        let mut failure = None;
        for (id, result) in spawned.into_iter().enumerate() {
            match result {
                Ok(worker) => ready.push(Slot { id, worker }),
                Err(err) => {
                    failure.get_or_insert((id, err));
                }
            }
        }
        if let Some((id, err)) = failure {
            let mut stopping: Vec<BoxFuture<'static, ()>> = Vec::with_capacity(ready.len());
            for slot in ready {
                stopping.push(slot.worker.terminate(Duration::ZERO));
            }
            join_all(stopping).await;
            return Err(err.context(format!("failed to start pool worker {id}")));
        }

        tracing::debug!(size, "Worker pool started");
        Ok(Self {
            inner: Arc::new(PoolInner {
                factory,
                size,
                cancel_grace,
                free: Mutex::new(FreeList {
                    vacancies: ready.into_iter().map(Vacancy::Ready).collect(),
                    closed: false,
                }),
                permits: Arc::new(Semaphore::new(size)),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
                handle: tokio::runtime::Handle::current(),
            }),
        })
    }

    /// Configured number of slots
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Number of slots currently free
    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Run `request` on the next free worker.
    ///
    /// Suspends until a slot is free. If `cancel` fires (or this future is dropped) while the
    /// job runs, the worker is terminated and replaced, and the job's result, should it still
    /// arrive, is discarded.
    pub async fn apply(
        &self,
        request: Request<F>,
        cancel: &CancellationToken,
    ) -> Result<Response<F>, PoolError> {
        let lease = self.claim(cancel).await?;
        self.run(lease, request, cancel).await
    }

    /// Run one request on every slot at once, e.g. to warm each worker.
    /// Waits until all slots are free.
    pub async fn broadcast<M>(&self, make_request: M) -> Vec<Result<Response<F>, PoolError>>
    where
        M: Fn(usize) -> Request<F>,
    {
        let never = CancellationToken::new();
        let mut leases = Vec::with_capacity(self.inner.size);
        for _ in 0..self.inner.size {
            match self.claim(&never).await {
                Ok(lease) => leases.push(lease),
                Err(err) => {
                    leases.into_iter().for_each(Lease::release);
                    return vec![Err(err)];
                }
            }
        }

        let mut runs = Vec::with_capacity(leases.len());
        for lease in leases {
            let request = make_request(lease.slot_id());
            runs.push(self.run(lease, request, &never));
        }
        join_all(runs).await
    }

    /// Terminate every worker, busy or idle. In-flight callers get [`PoolError::ShutDown`].
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        let idle: Vec<Vacancy<F::Worker>> = {
            let mut free = self.inner.free.lock();
            if free.closed {
                Vec::new()
            } else {
                free.closed = true;
                free.vacancies.drain(..).collect()
            }
        };

        if !self.inner.shutdown.is_cancelled() {
            tracing::debug!(idle = idle.len(), "Shutting down worker pool");
        }
        self.inner.shutdown.cancel();
        self.inner.permits.close();

        let grace = self.inner.cancel_grace;
        let mut stopping: Vec<BoxFuture<'static, ()>> = Vec::with_capacity(idle.len());
        for vacancy in idle {
            if let Vacancy::Ready(slot) = vacancy {
                stopping.push(slot.worker.terminate(grace));
            }
        }
        join_all(stopping).await;

        // busy workers are terminated by their callers' leases
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }

    async fn claim(&self, cancel: &CancellationToken) -> Result<Lease<F>, PoolError> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PoolError::Cancelled),
            _ = self.inner.shutdown.cancelled() => return Err(PoolError::ShutDown),
            permit = self.inner.permits.clone().acquire_owned() => {
                permit.map_err(|_| PoolError::ShutDown)?
            }
        };

        let Some(vacancy) = self.inner.free.lock().vacancies.pop_front() else {
            return Err(PoolError::ShutDown);
        };

        let mut lease = Lease {
            pool: self.inner.clone(),
            vacancy: Some(vacancy),
            permit: Some(permit),
        };
        lease.ensure_worker().await?;
        Ok(lease)
    }

    async fn run(
        &self,
        mut lease: Lease<F>,
        request: Request<F>,
        cancel: &CancellationToken,
    ) -> Result<Response<F>, PoolError> {
        let slot = lease.slot_id();
        let outcome = match lease.worker_mut() {
            Some(worker) => tokio::select! {
                result = worker.call(request) => Outcome::Finished(result),
                _ = cancel.cancelled() => Outcome::Cancelled,
                _ = self.inner.shutdown.cancelled() => Outcome::ShutDown,
            },
            None => Outcome::ShutDown,
        };

        match outcome {
            Outcome::Finished(Ok(response)) => {
                lease.release();
                Ok(response)
            }
            Outcome::Finished(Err(err)) => {
                let reason = format!("{err:#}");
                tracing::error!(slot, error = %reason, "Worker lost while running a job, replacing it");
                lease.discard();
                Err(PoolError::WorkerLost(reason))
            }
            Outcome::Cancelled => {
                tracing::debug!(slot, "Job cancelled, terminating its worker");
                lease.discard();
                Err(PoolError::Cancelled)
            }
            Outcome::ShutDown => {
                lease.discard();
                Err(PoolError::ShutDown)
            }
        }
    }
}

impl<F: WorkerFactory> PoolInner<F> {
    /// Return a vacancy to the free list and release its permit
    fn put_back(self: &Arc<Self>, vacancy: Vacancy<F::Worker>, permit: OwnedSemaphorePermit) {
        let rejected = {
            let mut free = self.free.lock();
            if free.closed {
                Some(vacancy)
            } else {
                free.vacancies.push_back(vacancy);
                None
            }
        };
        drop(permit);

        if let Some(Vacancy::Ready(slot)) = rejected {
            self.retire(slot.worker);
        }
    }

    fn retire(self: &Arc<Self>, worker: F::Worker) {
        let grace = self.cancel_grace;
        self.tracker
            .spawn_on(async move { worker.terminate(grace).await }, &self.handle);
    }

    /// Terminate a worker in the background and start a fresh one in its slot.
    /// The permit is held until the slot is usable again.
    fn replace(self: &Arc<Self>, slot: Slot<F::Worker>, permit: OwnedSemaphorePermit) {
        let pool = self.clone();
        self.tracker.spawn_on(
            async move {
                let Slot { id, worker } = slot;
                worker.terminate(pool.cancel_grace).await;
                if pool.shutdown.is_cancelled() {
                    return;
                }

                let vacancy = match pool.factory.spawn(id).await {
                    Ok(worker) => {
                        tracing::debug!(slot = id, "Replacement worker started");
                        Vacancy::Ready(Slot { id, worker })
                    }
                    Err(err) => {
                        tracing::warn!(
                            slot = id,
                            error = format!("{err:#}"),
                            "Failed to start replacement worker, retrying on next claim"
                        );
                        Vacancy::Empty(id)
                    }
                };
                pool.put_back(vacancy, permit);
            },
            &self.handle,
        );
    }
}

/// Exclusive use of one slot. Dropping a lease without releasing it treats the worker
/// as compromised and replaces it.
struct Lease<F: WorkerFactory> {
    pool: Arc<PoolInner<F>>,
    vacancy: Option<Vacancy<F::Worker>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl<F: WorkerFactory> Lease<F> {
    fn slot_id(&self) -> usize {
        self.vacancy.as_ref().map(Vacancy::id).unwrap_or_default()
    }

    fn worker_mut(&mut self) -> Option<&mut F::Worker> {
        match self.vacancy.as_mut() {
            Some(Vacancy::Ready(slot)) => Some(&mut slot.worker),
            _ => None,
        }
    }

    async fn ensure_worker(&mut self) -> Result<(), PoolError> {
        let pending = match &self.vacancy {
            Some(Vacancy::Empty(id)) => *id,
            _ => return Ok(()),
        };

        match self.pool.factory.spawn(pending).await {
            Ok(worker) => {
                tracing::info!(slot = pending, "Worker started for an empty slot");
                self.vacancy = Some(Vacancy::Ready(Slot {
                    id: pending,
                    worker,
                }));
                Ok(())
            }
            Err(err) => {
                let reason = format!("{err:#}");
                tracing::error!(slot = pending, error = %reason, "Failed to start worker");
                Err(PoolError::Spawn(reason))
            }
        }
    }

    /// The worker is healthy: hand it back
    fn release(mut self) {
        if let (Some(vacancy), Some(permit)) = (self.vacancy.take(), self.permit.take()) {
            self.pool.put_back(vacancy, permit);
        }
    }

    /// The worker must not be reused
    fn discard(mut self) {
        self.recycle();
    }

    fn recycle(&mut self) {
        match (self.vacancy.take(), self.permit.take()) {
            (Some(Vacancy::Ready(slot)), Some(permit)) => self.pool.replace(slot, permit),
            (Some(vacancy), Some(permit)) => self.pool.put_back(vacancy, permit),
            _ => {}
        }
    }
}

impl<F: WorkerFactory> Drop for Lease<F> {
    fn drop(&mut self) {
        self.recycle();
    }
}
