// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Pool workers backed by dedicated OS threads.
//!
//! A thread cannot be killed from the outside. Terminating a thread worker cancels the
//! job's token, waits up to the grace period for the thread to return, and otherwise
//! detaches it. Whatever it produces afterwards goes to [`JobHandler::discard`].

use std::marker::PhantomData;
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::{PoolWorker, WorkerFactory};

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Blocking job logic executed on a worker thread or inside a worker process.
pub trait JobHandler: Send + 'static {
    type Request: Send + 'static;
    type Response: Send + 'static;

    /// Run one job. Long jobs should check `cancel` and return early once it fires.
    fn handle(&mut self, request: Self::Request, cancel: &CancellationToken) -> Self::Response;

    /// Release a response nobody will receive because its job was given up.
    fn discard(response: Self::Response) {
        drop(response);
    }
}

struct Job<H: JobHandler> {
    request: H::Request,
    cancel: CancellationToken,
    reply: oneshot::Sender<H::Response>,
}

/// Builds one handler per thread with `make(slot)`, on the new thread itself.
pub struct ThreadWorkerFactory<H, M> {
    name: String,
    make: Arc<M>,
    _handler: PhantomData<fn() -> H>,
}

impl<H, M> ThreadWorkerFactory<H, M>
where
    H: JobHandler,
    M: Fn(usize) -> anyhow::Result<H> + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, make: M) -> Self {
        Self {
            name: name.into(),
            make: Arc::new(make),
            _handler: PhantomData,
        }
    }
}

#[async_trait]
impl<H, M> WorkerFactory for ThreadWorkerFactory<H, M>
where
    H: JobHandler,
    M: Fn(usize) -> anyhow::Result<H> + Send + Sync + 'static,
{
    type Worker = ThreadWorker<H>;

    async fn spawn(&self, slot: usize) -> anyhow::Result<ThreadWorker<H>> {
        let (jobs_tx, jobs_rx) = mpsc::channel::<Job<H>>();
        let (ready_tx, ready_rx) = oneshot::channel::<anyhow::Result<()>>();
        let make = self.make.clone();

        let thread = std::thread::Builder::new()
            .name(format!("{}-{}", self.name, slot))
            .spawn(move || {
                let mut handler = match (*make)(slot) {
                    Ok(handler) => {
                        let _ = ready_tx.send(Ok(()));
                        handler
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };

                while let Ok(Job {
                    request,
                    cancel,
                    reply,
                }) = jobs_rx.recv()
                {
                    let response = handler.handle(request, &cancel);
                    // the caller is gone if the job was cancelled
                    if let Err(response) = reply.send(response) {
                        H::discard(response);
                    }
                }
                tracing::trace!(slot, "Worker thread exiting");
            })?;

        ready_rx
            .await
            .map_err(|_| anyhow!("worker thread {slot} stopped during start-up"))??;

        Ok(ThreadWorker {
            slot,
            jobs: Some(jobs_tx),
            thread: Some(thread),
            current: None,
            pending: None,
        })
    }
}

pub struct ThreadWorker<H: JobHandler> {
    slot: usize,
    jobs: Option<mpsc::Sender<Job<H>>>,
    thread: Option<std::thread::JoinHandle<()>>,
    current: Option<CancellationToken>,
    // reply of the running job; kept here so an abandoned result can still be discarded
    pending: Option<oneshot::Receiver<H::Response>>,
}

impl<H: JobHandler> ThreadWorker<H> {
    fn discard_pending(&mut self) {
        let Some(mut pending) = self.pending.take() else {
            return;
        };
        // after close, a late reply bounces back to the thread, which discards it
        pending.close();
        if let Ok(response) = pending.try_recv() {
            tracing::debug!(slot = self.slot, "Discarding result of an abandoned job");
            H::discard(response);
        }
    }
}

#[async_trait]
impl<H: JobHandler> PoolWorker for ThreadWorker<H> {
    type Request = H::Request;
    type Response = H::Response;

    async fn call(&mut self, request: H::Request) -> anyhow::Result<H::Response> {
        let cancel = CancellationToken::new();
        let (reply, response) = oneshot::channel();
        {
            let jobs = self
                .jobs
                .as_ref()
                .ok_or_else(|| anyhow!("worker thread {} is stopped", self.slot))?;
            jobs.send(Job {
                request,
                cancel: cancel.clone(),
                reply,
            })
            .map_err(|_| anyhow!("worker thread {} has exited", self.slot))?;
        }
        self.current = Some(cancel);

        let slot = self.slot;
        let result = self
            .pending
            .insert(response)
            .await
            .map_err(|_| anyhow!("worker thread {slot} stopped before replying"));
        self.pending = None;
        self.current = None;
        result
    }

    async fn terminate(mut self, grace: Duration) {
        if let Some(cancel) = self.current.take() {
            cancel.cancel();
        }
        // closing the queue ends the thread's loop
        drop(self.jobs.take());

        let Some(thread) = self.thread.take() else {
            self.discard_pending();
            return;
        };
        let slot = self.slot;
        let deadline = Instant::now() + grace;
        while !thread.is_finished() {
            if Instant::now() >= deadline {
                tracing::warn!(
                    slot,
                    ?grace,
                    "Worker thread did not stop within the grace period, detaching it"
                );
                self.discard_pending();
                return;
            }
            tokio::time::sleep(JOIN_POLL_INTERVAL).await;
        }

        self.discard_pending();
        if thread.join().is_err() {
            tracing::warn!(slot, "Worker thread panicked");
        } else {
            tracing::trace!(slot, "Worker thread stopped");
        }
    }
}
