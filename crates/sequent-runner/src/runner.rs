//! Runners: drive the processes of a system.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use sequent_codec::EventMapper;
use sequent_process::{Policy, ProcessApplication};
use sequent_store_core::{ApplicationRecorder, EventStore, ProcessRecorder};
use sequent_types::{PipelineId, Topic, DEFAULT_PIPELINE};

use crate::{InProcessTransport, Prompt, PromptTransport, RunnerError, System};

//─────────────────────────────
//  Process specifications
//─────────────────────────────

/// Everything needed to instantiate one process of a system.
pub struct ProcessSpec {
    /// Process name, matching the system definition.
    pub name: String,
    /// Codec pipeline for the process's own events and the ones it reads.
    pub mapper: Arc<EventMapper>,
    /// The user policy.
    pub policy: Arc<dyn Policy>,
    /// Topics that invoke the policy; everything when `None`.
    pub filter: Option<Vec<Topic>>,
}

impl ProcessSpec {
    /// Specify a process.
    pub fn new(
        name: impl Into<String>,
        mapper: Arc<EventMapper>,
        policy: Arc<dyn Policy>,
    ) -> Self {
        Self {
            name: name.into(),
            mapper,
            policy,
            filter: None,
        }
    }

    /// Only invoke the policy for these topics.
    pub fn with_topic_filter(mut self, topics: impl IntoIterator<Item = Topic>) -> Self {
        self.filter = Some(topics.into_iter().collect());
        self
    }
}

async fn build_processes<R>(
    system: &System,
    specs: Vec<ProcessSpec>,
    recorder: &Arc<R>,
    pipeline_id: PipelineId,
    cancel: &CancellationToken,
) -> Result<Vec<Arc<ProcessApplication>>, RunnerError>
where
    R: ProcessRecorder + 'static,
{
    let mut by_name: HashMap<String, ProcessSpec> =
        specs.into_iter().map(|s| (s.name.clone(), s)).collect();

    let mut mappers: HashMap<String, Arc<EventMapper>> = HashMap::new();
    let mut processes = Vec::new();
    for name in system.processes() {
        let spec = by_name
            .remove(name)
            .ok_or_else(|| RunnerError::UnknownProcess(name.clone()))?;
        mappers.insert(name.clone(), Arc::clone(&spec.mapper));

        let mut process = ProcessApplication::new(
            name.clone(),
            pipeline_id,
            spec.mapper,
            Arc::clone(recorder),
            spec.policy,
        )
        .with_cancellation(cancel.child_token());
        if let Some(filter) = spec.filter {
            process = process.with_topic_filter(filter);
        }
        processes.push(Arc::new(process));
    }

    // Wire the follow edges: each downstream reads the shared log through
    // its upstream's codec.
    for (upstream, downstream) in system.edges() {
        let mapper = Arc::clone(&mappers[upstream]);
        let log = EventStore::new(
            mapper,
            Arc::clone(recorder) as Arc<dyn ApplicationRecorder>,
        );
        let target = processes
            .iter()
            .find(|p| p.name() == downstream)
            .ok_or_else(|| RunnerError::UnknownProcess(downstream.clone()))?;
        target.follow(upstream.clone(), log).await;
    }

    Ok(processes)
}

//─────────────────────────────
//  Single-threaded runner
//─────────────────────────────

/// Drives the whole graph synchronously on the caller's task.
///
/// Each call to [`SingleThreadedRunner::drive`] loops over the processes
/// until no process makes progress, so a commit is propagated to all
/// followers (including across cycles) before the call returns. This
/// eliminates concurrency, which makes it the runner of choice for tests.
pub struct SingleThreadedRunner {
    processes: Vec<Arc<ProcessApplication>>,
}

impl SingleThreadedRunner {
    /// Instantiate the system's processes over a shared recorder.
    pub async fn start<R>(
        system: System,
        specs: Vec<ProcessSpec>,
        recorder: Arc<R>,
    ) -> Result<Self, RunnerError>
    where
        R: ProcessRecorder + 'static,
    {
        let cancel = CancellationToken::new();
        let processes =
            build_processes(&system, specs, &recorder, DEFAULT_PIPELINE, &cancel).await?;
        Ok(Self { processes })
    }

    /// Access a process by name.
    pub fn process(&self, name: &str) -> Option<&Arc<ProcessApplication>> {
        self.processes.iter().find(|p| p.name() == name)
    }

    /// Drive every process until the whole graph is quiescent; returns
    /// the number of notifications processed.
    pub async fn drive(&self) -> Result<usize, RunnerError> {
        let mut total = 0;
        loop {
            let mut progressed = 0;
            for process in &self.processes {
                progressed += process.run_once().await?;
            }
            if progressed == 0 {
                return Ok(total);
            }
            total += progressed;
        }
    }
}

//─────────────────────────────
//  Worker
//─────────────────────────────

/// Drives one `(process, pipeline)` pair until cancelled.
///
/// The worker drains its process to the head, announces progress on the
/// prompt transport, then waits for a prompt about one of its upstreams,
/// falling back to polling after `prompt_timeout`. One worker per OS
/// process over a shared database and an external transport is the
/// multi-process deployment; [`MultiThreadedRunner`] runs the same worker
/// on one task per process.
pub struct ProcessWorker {
    process: Arc<ProcessApplication>,
    upstream_names: Vec<String>,
    transport: Arc<dyn PromptTransport>,
    prompt_timeout: Duration,
}

impl ProcessWorker {
    /// Create a worker for one process instance.
    pub fn new(
        process: Arc<ProcessApplication>,
        upstream_names: Vec<String>,
        transport: Arc<dyn PromptTransport>,
        prompt_timeout: Duration,
    ) -> Self {
        Self {
            process,
            upstream_names,
            transport,
            prompt_timeout,
        }
    }

    /// Run until the process's cancellation token fires.
    ///
    /// The current iteration always completes before the worker exits, so
    /// cancellation never leaves a half-processed notification behind.
    pub async fn run(self) -> Result<(), RunnerError> {
        let cancel = self.process.cancellation_token();
        let mut prompts = self.transport.subscribe();
        info!(
            process = %self.process.name(),
            pipeline = self.process.pipeline_id(),
            "worker started"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let processed = self.process.run_to_head().await?;
            if processed > 0 {
                self.transport.send(Prompt {
                    upstream_name: self.process.name().to_owned(),
                    pipeline_id: self.process.pipeline_id(),
                });
                // More work may have been prompted by our own commits.
                continue;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                received = prompts.recv() => match received {
                    Ok(prompt) => {
                        if !self.relevant(&prompt) {
                            continue;
                        }
                    }
                    // Missed prompts are covered by the next polling tick.
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => {
                        tokio::time::sleep(self.prompt_timeout).await;
                    }
                },
                _ = tokio::time::sleep(self.prompt_timeout) => {}
            }
        }

        info!(process = %self.process.name(), "worker stopped");
        Ok(())
    }

    fn relevant(&self, prompt: &Prompt) -> bool {
        prompt.pipeline_id == self.process.pipeline_id()
            && self.upstream_names.iter().any(|u| u == &prompt.upstream_name)
    }
}

//─────────────────────────────
//  Multi-threaded runner
//─────────────────────────────

/// One worker task per process, woken by prompts with polling fallback.
pub struct MultiThreadedRunner {
    cancel: CancellationToken,
    transport: InProcessTransport,
    processes: Vec<Arc<ProcessApplication>>,
    workers: Vec<(String, JoinHandle<Result<(), RunnerError>>)>,
}

impl MultiThreadedRunner {
    /// Instantiate the system over a shared recorder and start a worker
    /// task per process.
    pub async fn start<R>(
        system: System,
        specs: Vec<ProcessSpec>,
        recorder: Arc<R>,
        prompt_timeout: Duration,
    ) -> Result<Self, RunnerError>
    where
        R: ProcessRecorder + 'static,
    {
        let cancel = CancellationToken::new();
        let transport = InProcessTransport::default();
        let processes =
            build_processes(&system, specs, &recorder, DEFAULT_PIPELINE, &cancel).await?;

        let mut workers = Vec::new();
        for process in &processes {
            let upstream_names = system
                .upstreams_of(process.name())
                .into_iter()
                .map(str::to_owned)
                .collect();
            let worker = ProcessWorker::new(
                Arc::clone(process),
                upstream_names,
                Arc::new(transport.clone()) as Arc<dyn PromptTransport>,
                prompt_timeout,
            );
            let name = process.name().to_owned();
            workers.push((name, tokio::spawn(worker.run())));
        }

        Ok(Self {
            cancel,
            transport,
            processes,
            workers,
        })
    }

    /// Access a process by name.
    pub fn process(&self, name: &str) -> Option<&Arc<ProcessApplication>> {
        self.processes.iter().find(|p| p.name() == name)
    }

    /// Announce new work on a log, e.g. after an external append.
    pub fn prompt(&self, upstream_name: impl Into<String>, pipeline_id: PipelineId) {
        self.transport.send(Prompt {
            upstream_name: upstream_name.into(),
            pipeline_id,
        });
    }

    /// Cooperatively stop all workers and wait for them to finish their
    /// current iteration.
    pub async fn stop(self) -> Result<(), RunnerError> {
        self.cancel.cancel();
        let (names, handles): (Vec<_>, Vec<_>) = self.workers.into_iter().unzip();
        for (name, joined) in names.into_iter().zip(join_all(handles).await) {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(process = %name, error = %err, "worker failed");
                    return Err(err);
                }
                Err(_) => return Err(RunnerError::WorkerFailed(name)),
            }
        }
        Ok(())
    }
}
