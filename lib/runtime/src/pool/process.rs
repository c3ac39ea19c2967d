// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Pool workers running in child processes.
//!
//! Each slot is a freshly started process (never a fork of the parent) that speaks
//! newline-delimited JSON frames over stdin/stdout. Anything else the child prints on
//! stdout is logged and skipped; stderr is inherited so worker logs reach the terminal.
//!
//! ```text
//! parent -> worker   {"type":"job","id":0,"request":...}
//!                    {"type":"cancel","id":0}
//! worker -> parent   {"type":"ready","pid":4242}
//!                    {"type":"done","id":0,"response":...}
//!                    {"type":"failed","message":"..."}
//! ```
//!
//! Closing the worker's stdin asks it to exit once the current job returns. A job that
//! finishes after its cancel never gets a `done` frame; the worker hands its response to
//! [`JobHandler::discard`] instead.

use std::marker::PhantomData;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_util::sync::CancellationToken;

use super::thread::JobHandler;
use super::{PoolWorker, WorkerFactory};
use crate::config::environment_names::worker::MODELSERVE_WORKER_SLOT;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToWorker<Req> {
    Job { id: u64, request: Req },
    Cancel { id: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FromWorker<Resp> {
    Ready { pid: u32 },
    Done { id: u64, response: Resp },
    Failed { message: String },
}

/// How to start a worker process.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Re-run the current executable, typically with a hidden worker subcommand
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

}

pub struct ProcessWorkerFactory<Req, Resp> {
    command: WorkerCommand,
    start_timeout: Duration,
    discard: fn(Resp),
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> ProcessWorkerFactory<Req, Resp> {
    pub fn new(command: WorkerCommand, start_timeout: Duration) -> Self {
        Self {
            command,
            start_timeout,
            discard: drop,
            _types: PhantomData,
        }
    }

    /// Called with results that arrive after their job was given up, e.g. to remove
    /// files they reference.
    pub fn with_discard(mut self, discard: fn(Resp)) -> Self {
        self.discard = discard;
        self
    }
}

#[async_trait]
impl<Req, Resp> WorkerFactory for ProcessWorkerFactory<Req, Resp>
where
    Req: Serialize + Send + 'static,
    Resp: DeserializeOwned + Send + 'static,
{
    type Worker = ProcessWorker<Req, Resp>;

    async fn spawn(&self, slot: usize) -> anyhow::Result<Self::Worker> {
        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .env(MODELSERVE_WORKER_SLOT, slot.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| {
                format!(
                    "failed to start worker process {}",
                    self.command.program.display()
                )
            })?;

        let stdin = child.stdin.take().context("worker stdin was not captured")?;
        let stdout = child
            .stdout
            .take()
            .context("worker stdout was not captured")?;

        let mut worker = ProcessWorker {
            slot,
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout).lines(),
            next_id: 0,
            busy: None,
            discard: self.discard,
            _types: PhantomData,
        };

        let first = tokio::time::timeout(self.start_timeout, worker.next_frame()).await;
        let failure = match first {
            Ok(Ok(FromWorker::Ready { pid })) => {
                tracing::debug!(slot, pid, "Worker process ready");
                return Ok(worker);
            }
            Ok(Ok(FromWorker::Failed { message })) => {
                anyhow::anyhow!("worker process {slot} failed to start: {message}")
            }
            Ok(Ok(FromWorker::Done { .. })) => {
                anyhow::anyhow!("worker process {slot} sent a result before it was ready")
            }
            Ok(Err(err)) => err.context(format!("worker process {slot} failed to start")),
            Err(_) => anyhow::anyhow!(
                "worker process {slot} was not ready within {:?}",
                self.start_timeout
            ),
        };
        worker.kill().await;
        Err(failure)
    }
}

pub struct ProcessWorker<Req, Resp> {
    slot: usize,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
    busy: Option<u64>,
    discard: fn(Resp),
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> ProcessWorker<Req, Resp>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn send(&mut self, frame: ToWorker<Req>) -> anyhow::Result<()> {
        let line = encode_frame(&frame)?;
        let stdin = self
            .stdin
            .as_mut()
            .context("worker stdin is already closed")?;
        write_line(stdin, &line).await
    }

    async fn next_frame(&mut self) -> anyhow::Result<FromWorker<Resp>> {
        loop {
            let Some(line) = self
                .stdout
                .next_line()
                .await
                .context("failed to read from worker process")?
            else {
                let status = match self.child.try_wait() {
                    Ok(Some(status)) => status.to_string(),
                    _ => "still running".to_string(),
                };
                anyhow::bail!(
                    "worker process {} closed its output ({status})",
                    self.slot
                );
            };

            match serde_json::from_str::<serde_json::Value>(&line) {
                Ok(value) if value.get("type").is_some() => {
                    return serde_json::from_value(value).with_context(|| {
                        format!("malformed frame from worker process {}", self.slot)
                    });
                }
                _ => tracing::info!(slot = self.slot, "worker: {}", line),
            }
        }
    }

    async fn kill(&mut self) {
        if let Err(err) = self.child.kill().await {
            tracing::warn!(slot = self.slot, error = %err, "Failed to kill worker process");
        }
    }
}

#[async_trait]
impl<Req, Resp> PoolWorker for ProcessWorker<Req, Resp>
where
    Req: Serialize + Send + 'static,
    Resp: DeserializeOwned + Send + 'static,
{
    type Request = Req;
    type Response = Resp;

    async fn call(&mut self, request: Req) -> anyhow::Result<Resp> {
        let id = self.next_id;
        self.next_id += 1;
        self.send(ToWorker::Job { id, request }).await?;
        self.busy = Some(id);

        loop {
            match self.next_frame().await? {
                FromWorker::Done { id: done, response } if done == id => {
                    self.busy = None;
                    return Ok(response);
                }
                FromWorker::Done {
                    id: stale,
                    response,
                } => {
                    tracing::debug!(slot = self.slot, stale, "Discarding stale worker result");
                    (self.discard)(response);
                }
                FromWorker::Failed { message } => {
                    anyhow::bail!("worker process {} failed: {message}", self.slot)
                }
                FromWorker::Ready { .. } => {}
            }
        }
    }

    async fn terminate(mut self, grace: Duration) {
        let slot = self.slot;
        if let Some(id) = self.busy.take() {
            if let Err(err) = self.send(ToWorker::Cancel { id }).await {
                tracing::debug!(slot, error = %err, "Could not deliver cancel to worker");
            }
        }
        drop(self.stdin.take());

        // results still in the pipe belong to abandoned jobs
        let exited = tokio::time::timeout(grace, async {
            while let Ok(frame) = self.next_frame().await {
                if let FromWorker::Done { id, response } = frame {
                    tracing::debug!(slot, id, "Discarding result of an abandoned job");
                    (self.discard)(response);
                }
            }
            self.child.wait().await
        })
        .await;

        match exited {
            Ok(Ok(status)) => tracing::debug!(slot, %status, "Worker process exited"),
            Ok(Err(err)) => {
                tracing::warn!(slot, error = %err, "Failed to wait for worker process");
                self.kill().await;
            }
            Err(_) => {
                tracing::warn!(
                    slot,
                    ?grace,
                    "Worker process did not exit within the grace period, killing it"
                );
                self.kill().await;
            }
        }
    }
}

fn encode_frame<T: Serialize>(frame: &T) -> anyhow::Result<Vec<u8>> {
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    Ok(line)
}

async fn write_line<W>(out: &mut W, line: &[u8]) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    out.write_all(line).await?;
    out.flush().await?;
    Ok(())
}

/// Tell the parent this worker could not start. Call it instead of [`serve`] when
/// building the handler fails.
pub async fn report_startup_failure(err: &anyhow::Error) -> anyhow::Result<()> {
    let line = encode_frame(&FromWorker::<()>::Failed {
        message: format!("{err:#}"),
    })?;
    write_line(&mut tokio::io::stdout(), &line).await
}

/// Worker-process side of the protocol: announce readiness, then run jobs read from
/// stdin until it closes.
///
/// Jobs run on a blocking thread while stdin stays watched, so a `cancel` frame (or the
/// parent closing stdin) reaches the handler through its [`CancellationToken`].
pub async fn serve<H>(mut handler: H) -> anyhow::Result<()>
where
    H: JobHandler,
    H::Request: DeserializeOwned,
    H::Response: Serialize,
{
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let ready = encode_frame(&FromWorker::<H::Response>::Ready {
        pid: std::process::id(),
    })?;
    write_line(&mut stdout, &ready).await?;

    while let Some(line) = lines.next_line().await? {
        let (id, request) = match serde_json::from_str::<ToWorker<H::Request>>(&line) {
            Ok(ToWorker::Job { id, request }) => (id, request),
            Ok(ToWorker::Cancel { .. }) => continue,
            Err(err) => {
                tracing::warn!(error = %err, "Ignoring malformed frame from parent");
                continue;
            }
        };

        let cancel = CancellationToken::new();
        let job_cancel = cancel.clone();
        let mut task = tokio::task::spawn_blocking(move || {
            let response = handler.handle(request, &job_cancel);
            (handler, response)
        });

        let mut input_open = true;
        let (returned, response) = loop {
            tokio::select! {
                joined = &mut task => break joined.context("job handler panicked")?,
                next = lines.next_line(), if input_open => match next? {
                    Some(line) => {
                        if let Ok(ToWorker::Cancel { id: target }) =
                            serde_json::from_str::<ToWorker<H::Request>>(&line)
                        {
                            if target == id {
                                cancel.cancel();
                            }
                        }
                    }
                    None => {
                        input_open = false;
                        cancel.cancel();
                    }
                },
            }
        };
        handler = returned;

        if cancel.is_cancelled() {
            // the parent stopped waiting for this job
            H::discard(response);
        } else {
            let done = encode_frame(&FromWorker::Done { id, response })?;
            write_line(&mut stdout, &done).await?;
        }
        if !input_open {
            break;
        }
    }

    tracing::debug!("Worker input closed, exiting");
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::pool::{CancellablePool, PoolError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    const ECHO_WORKER: &str = r#"
echo '{"type":"ready","pid":0}'
i=0
while read line; do
  echo "not a frame"
  echo "{\"type\":\"done\",\"id\":$i,\"response\":\"pong-$i\"}"
  i=$((i+1))
done
"#;

    const SLEEPY_WORKER: &str = r#"
echo '{"type":"ready","pid":0}'
while read line; do
  sleep 30
done
"#;

    fn shell(script: &str) -> ProcessWorkerFactory<String, String> {
        ProcessWorkerFactory::new(
            WorkerCommand::new("/bin/sh").arg("-c").arg(script),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_frame_format() {
        let job = ToWorker::Job {
            id: 3,
            request: serde_json::json!({"x": 1}),
        };
        assert_eq!(
            serde_json::to_string(&job).unwrap(),
            r#"{"type":"job","id":3,"request":{"x":1}}"#
        );

        let done: FromWorker<String> =
            serde_json::from_str(r#"{"type":"done","id":3,"response":"ok"}"#).unwrap();
        assert!(matches!(done, FromWorker::Done { id: 3, response } if response == "ok"));
    }

    #[tokio::test]
    async fn test_process_worker_round_trip() {
        let mut worker = shell(ECHO_WORKER).spawn(0).await.unwrap();
        assert!(worker.pid().is_some());
        assert_eq!(worker.call("ping".to_string()).await.unwrap(), "pong-0");
        assert_eq!(worker.call("ping".to_string()).await.unwrap(), "pong-1");
        worker.terminate(Duration::from_secs(2)).await;
    }

    static LATE_RESULTS: AtomicUsize = AtomicUsize::new(0);

    fn count_late_result(_response: String) {
        LATE_RESULTS.fetch_add(1, Ordering::SeqCst);
    }

    #[tokio::test]
    async fn test_late_result_is_discarded_on_terminate() {
        let script = r#"
echo '{"type":"ready","pid":0}'
read line
sleep 0.3
echo '{"type":"done","id":0,"response":"late"}'
"#;
        let factory = shell(script).with_discard(count_late_result);
        let mut worker = factory.spawn(0).await.unwrap();

        let abandoned =
            tokio::time::timeout(Duration::from_millis(20), worker.call("work".to_string())).await;
        assert!(abandoned.is_err());
        assert_eq!(LATE_RESULTS.load(Ordering::SeqCst), 0);

        worker.terminate(Duration::from_secs(2)).await;
        assert_eq!(LATE_RESULTS.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_startup_failure_frame() {
        let factory = shell(r#"echo '{"type":"failed","message":"model missing"}'"#);
        let err = factory.spawn(0).await.err().unwrap();
        assert!(format!("{err:#}").contains("model missing"));
    }

    #[tokio::test]
    async fn test_startup_timeout() {
        let factory: ProcessWorkerFactory<String, String> = ProcessWorkerFactory::new(
            WorkerCommand::new("/bin/sh").arg("-c").arg("sleep 30"),
            Duration::from_millis(200),
        );
        let err = factory.spawn(0).await.err().unwrap();
        assert!(err.to_string().contains("not ready"));
    }

    #[tokio::test]
    async fn test_exiting_worker_is_lost_and_replaced() {
        let script = r#"
echo '{"type":"ready","pid":0}'
read line
exit 3
"#;
        let pool = CancellablePool::new(shell(script), 1, Duration::from_millis(200))
            .await
            .unwrap();
        let token = CancellationToken::new();

        let result = pool.apply("ping".to_string(), &token).await;
        assert!(matches!(result, Err(PoolError::WorkerLost(_))));

        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.available() != 1 {
            assert!(Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_kills_stuck_process() {
        let pool = CancellablePool::new(shell(SLEEPY_WORKER), 1, Duration::from_millis(200))
            .await
            .unwrap();
        let token = CancellationToken::new();

        let job = {
            let pool = pool.clone();
            let token = token.clone();
            tokio::spawn(async move { pool.apply("work".to_string(), &token).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();

        let started = Instant::now();
        assert_eq!(job.await.unwrap(), Err(PoolError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(1));

        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.available() != 1 {
            assert!(Instant::now() < deadline, "slot was not restored");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        pool.shutdown().await;
    }
}
