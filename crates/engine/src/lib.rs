#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! Spawn and shutdown plumbing every stage worker runs under.
//!
//! Every FitGlue stage both reads one topic and writes others, so there is
//! no receiver/processor/exporter asymmetry the way there is in a
//! telemetry pipeline: each stage is modeled as one [`Worker`], and
//! `Engine` spawns exactly one `tokio::task` per worker, registered with
//! `task::TaskManager` for join/cleanup, the same way the teacher's engine
//! spawns one task per receiver/exporter instance.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use task::labels::{ProcessLabels, TaskLabels};
use task::TaskManager;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Errors raised by the engine.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A runtime error occurred spawning or stopping a worker.
    #[error("engine runtime error (reason: {error})")]
    Runtime {
        /// What went wrong.
        error: String,
    },

    /// A command could not be delivered to the engine's command loop.
    #[error("command error (reason: {error}, command: {command})")]
    Command {
        /// The command that failed to send.
        command: String,
        /// What went wrong.
        error: String,
    },
}

/// The signal a running worker awaits to know when to stop. Dropping the
/// engine (or calling `Command::StopAll`) closes the channel, so `stopped`
/// resolves either on an explicit stop or on engine shutdown.
pub struct StopSignal {
    receiver: mpsc::Receiver<()>,
}

impl StopSignal {
    fn new(receiver: mpsc::Receiver<()>) -> Self {
        Self { receiver }
    }

    /// Resolves once the engine asks this worker to stop.
    pub async fn stopped(&mut self) {
        let _ = self.receiver.recv().await;
    }
}

/// A stage worker: Splitter, Deduplication Gate, Enricher Orchestrator,
/// Destination Router, or an upload consumer. A worker owns whatever
/// message-bus subscriptions and store handles its stage needs; `run`
/// should loop, processing one envelope at a time, until `stop` resolves.
#[async_trait]
pub trait Worker: Send + 'static {
    /// A short, stable name used for logging and task labeling.
    fn name(&self) -> &str;

    /// Runs the worker until told to stop or until it exits on its own
    /// (e.g. its upstream subscription closes).
    async fn run(&mut self, stop: StopSignal) -> Result<(), Error>;
}

/// All the commands supported by the engine.
#[derive(Debug)]
#[non_exhaustive]
pub enum Command {
    /// Stops every worker currently registered with the engine.
    StopAll,
}

impl Command {
    /// Returns the name of the command, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::StopAll => "stop_all",
        }
    }
}

/// A handle other parts of the process use to send commands to a running
/// engine (e.g. from a signal handler or an admin endpoint, both out of
/// this crate's scope).
pub struct CommandHandler {
    sender: mpsc::Sender<Command>,
}

impl CommandHandler {
    fn new(sender: mpsc::Sender<Command>) -> Self {
        Self { sender }
    }

    /// Sends `command` to the engine.
    pub fn send(&self, command: Command) -> Result<(), Error> {
        let command_name = command.name().to_string();
        self.sender.try_send(command).map_err(|err| Error::Command {
            command: command_name,
            error: err.to_string(),
        })
    }
}

#[derive(Clone, Default)]
struct WorkerController {
    workers: Arc<Mutex<Vec<(String, mpsc::Sender<()>)>>>,
}

impl WorkerController {
    fn add(&self, name: String, stop_sender: mpsc::Sender<()>) {
        self.workers
            .lock()
            .expect("worker controller lock poisoned")
            .push((name, stop_sender));
    }

    fn stop_all(&self) {
        let workers = self.workers.lock().expect("worker controller lock poisoned");
        info!(worker_count = workers.len(), "stopping all workers");
        for (name, stop_sender) in workers.iter() {
            if stop_sender.try_send(()).is_err() {
                tracing::debug!(worker = %name, "worker already stopped");
            }
        }
    }
}

/// Runs a set of [`Worker`]s, each on its own `tokio::task`, and exposes a
/// [`CommandHandler`] to stop them.
pub struct Engine {
    task_manager: TaskManager,
    controller: WorkerController,
}

impl Engine {
    /// Creates a new engine and its command handler. The command handler's
    /// receiving loop runs as long as the engine does.
    pub fn new(process_labels: ProcessLabels) -> (Self, CommandHandler) {
        let controller = WorkerController::default();
        let (command_sender, command_receiver) = mpsc::channel(8);

        let command_loop_controller = controller.clone();
        let _ = tokio::task::spawn(run_command_loop(command_loop_controller, command_receiver));

        (
            Engine {
                task_manager: TaskManager::with_process_labels(process_labels),
                controller,
            },
            CommandHandler::new(command_sender),
        )
    }

    /// Spawns `worker` on its own task and registers it with the engine's
    /// task manager and worker controller.
    pub fn spawn<W>(&mut self, mut worker: W)
    where
        W: Worker,
    {
        let name = worker.name().to_string();
        let (stop_sender, stop_receiver) = mpsc::channel(1);
        self.controller.add(name.clone(), stop_sender);

        let process_labels = self.task_manager.process_labels();
        let task_labels = TaskLabels {
            task_cat: "worker".into(),
            task_id: name.clone(),
            task_source: "engine".into(),
        };
        let task_labels_clone = task_labels.clone();

        let join_handle = tokio::task::spawn(async move {
            if let Err(err) = worker.run(StopSignal::new(stop_receiver)).await {
                error!(worker = %name, error = %err, "worker exited with an error");
            } else {
                info!(worker = %name, "worker stopped normally");
            }
            TaskManager::no_task_cleaner(process_labels, task_labels_clone)
        });

        self.task_manager.register(join_handle, &task_labels);
    }

    /// Waits for every spawned worker to finish, running their cleanup
    /// hooks as each one completes.
    pub async fn join(&self) {
        self.task_manager.join().await;
    }
}

async fn run_command_loop(controller: WorkerController, mut receiver: mpsc::Receiver<Command>) {
    while let Some(command) = receiver.recv().await {
        match command {
            Command::StopAll => controller.stop_all(),
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    struct CountingWorker {
        name: &'static str,
        ticks: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Worker for CountingWorker {
        fn name(&self) -> &str {
            self.name
        }

        async fn run(&mut self, mut stop: StopSignal) -> Result<(), Error> {
            loop {
                tokio::select! {
                    _ = stop.stopped() => return Ok(()),
                    _ = tokio::time::sleep(Duration::from_millis(1)) => {
                        let _ = self.ticks.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn stop_all_stops_every_spawned_worker() {
        let (mut engine, handler) = Engine::new(ProcessLabels::new("test"));
        let ticks = Arc::new(AtomicUsize::new(0));

        engine.spawn(CountingWorker {
            name: "splitter",
            ticks: ticks.clone(),
        });
        engine.spawn(CountingWorker {
            name: "router",
            ticks: ticks.clone(),
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        handler.send(Command::StopAll).unwrap();

        tokio::time::timeout(Duration::from_secs(1), engine.join()).await.expect("engine joined before timeout");

        assert!(ticks.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn command_name_is_stable() {
        assert_eq!(Command::StopAll.name(), "stop_all");
    }
}
