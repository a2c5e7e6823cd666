//! Per-backend query executor.
//!
//! One actor task owns the queue, the connection cache and the in-flight
//! executions; callers talk to it through an [`ExecutorHandle`]. All state
//! is mutated on the actor between suspension points, so nothing inside
//! needs a lock.
//!
//! Scheduling rules:
//!
//! - Tasks are dispatched FIFO while fewer than `max_parallel` physical
//!   executions are running.
//! - A queued task whose `(descriptor, fingerprint)` is already executing
//!   waits for that execution instead of starting its own.
//! - When an execution completes, every queued task with the same
//!   descriptor and fingerprint is resolved from it: the error is cloned,
//!   or the shared rows are narrowed by each task's keybindings. A connect
//!   failure resolves every queued task on the descriptor.
//! - The first remaining task on the same descriptor is promoted to the
//!   head of the queue so the connection is reused.
//! - A failed execution discards its connection. A connection with no
//!   queued or running task left is closed.

use crate::error::{TaskError, TaskErrorKind};
use crate::reconcile::reconcile;
use crate::task::{Fingerprint, Task};
use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tabmon_adapter::{BackendAdapter, Connection};
use tabmon_common::descriptor::redact;
use tabmon_common::row::Row;
use tokio::sync::{mpsc, oneshot, OnceCell};

pub type TaskResult = Result<Vec<Row>, TaskError>;

type ConnectionCell = Arc<OnceCell<Result<Arc<dyn Connection>, TaskError>>>;

enum Command {
    Submit(Arc<Task>, oneshot::Sender<TaskResult>),
    Shutdown(oneshot::Sender<()>),
}

/// Cheap, cloneable handle to a running executor.
#[derive(Clone)]
pub struct ExecutorHandle {
    backend: String,
    tx: mpsc::UnboundedSender<Command>,
}

impl ExecutorHandle {
    /// Starts an executor for `adapter` on the current Tokio runtime.
    /// `max_parallel` is clamped to at least 1.
    pub fn spawn(adapter: Arc<dyn BackendAdapter>, max_parallel: usize) -> Self {
        let backend = adapter.name().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let executor = Executor {
            backend: backend.clone(),
            adapter,
            max_parallel: max_parallel.max(1),
            queue: VecDeque::new(),
            running: 0,
            in_flight: Vec::new(),
            running_per_descriptor: HashMap::new(),
            connections: HashMap::new(),
            next_generation: 0,
            work: FuturesUnordered::new(),
        };
        tokio::spawn(executor.run(rx));
        Self { backend, tx }
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Queues `task` and waits for its single resolution.
    pub async fn submit(&self, task: Arc<Task>) -> TaskResult {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Command::Submit(task, reply_tx)).is_err() {
            return Err(stopped(&self.backend));
        }
        reply_rx.await.unwrap_or_else(|_| Err(stopped(&self.backend)))
    }

    /// Stops accepting tasks, lets queued and running work finish, then
    /// closes every connection.
    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

fn stopped(backend: &str) -> TaskError {
    TaskError::new(TaskErrorKind::Connect, format!("{backend} executor is not running"))
}

struct Pending {
    task: Arc<Task>,
    fingerprint: Fingerprint,
    reply: oneshot::Sender<TaskResult>,
}

struct Slot {
    generation: u64,
    cell: ConnectionCell,
}

enum Completion {
    Executed {
        leader: Pending,
        generation: u64,
        outcome: Result<Arc<Vec<Row>>, TaskError>,
    },
    Closed {
        descriptor: String,
    },
}

struct Executor {
    backend: String,
    adapter: Arc<dyn BackendAdapter>,
    max_parallel: usize,
    queue: VecDeque<Pending>,
    running: usize,
    in_flight: Vec<(String, Fingerprint)>,
    running_per_descriptor: HashMap<String, usize>,
    connections: HashMap<String, Slot>,
    next_generation: u64,
    work: FuturesUnordered<BoxFuture<'static, Completion>>,
}

impl Executor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let mut accepting = true;
        let mut shutdown_ack = None;

        loop {
            if !accepting && self.queue.is_empty() && self.running == 0 && self.work.is_empty() {
                break;
            }
            tokio::select! {
                command = rx.recv(), if accepting => match command {
                    Some(Command::Submit(task, reply)) => self.enqueue(task, reply),
                    Some(Command::Shutdown(ack)) => {
                        accepting = false;
                        shutdown_ack = Some(ack);
                    }
                    None => accepting = false,
                },
                Some(done) = self.work.next(), if !self.work.is_empty() => self.complete(done),
                else => break,
            }
        }

        self.close_all().await;
        tracing::info!(backend = %self.backend, "Executor stopped");
        if let Some(ack) = shutdown_ack {
            let _ = ack.send(());
        }
    }

    fn enqueue(&mut self, task: Arc<Task>, reply: oneshot::Sender<TaskResult>) {
        let fingerprint = task.fingerprint();
        self.queue.push_back(Pending {
            task,
            fingerprint,
            reply,
        });
        self.dispatch();
    }

    fn is_in_flight(&self, descriptor: &str, fingerprint: &Fingerprint) -> bool {
        self.in_flight
            .iter()
            .any(|(d, f)| d == descriptor && f == fingerprint)
    }

    fn dispatch(&mut self) {
        while self.running < self.max_parallel {
            let Some(index) = self
                .queue
                .iter()
                .position(|p| !self.is_in_flight(&p.task.descriptor, &p.fingerprint))
            else {
                break;
            };
            let Some(pending) = self.queue.remove(index) else {
                break;
            };
            self.start(pending);
        }
    }

    fn start(&mut self, pending: Pending) {
        let descriptor = pending.task.descriptor.clone();
        self.running += 1;
        *self
            .running_per_descriptor
            .entry(descriptor.clone())
            .or_default() += 1;
        self.in_flight
            .push((descriptor.clone(), pending.fingerprint.clone()));

        let next_generation = &mut self.next_generation;
        let slot = self.connections.entry(descriptor).or_insert_with(|| {
            *next_generation += 1;
            Slot {
                generation: *next_generation,
                cell: Arc::new(OnceCell::new()),
            }
        });
        let generation = slot.generation;
        let cell = slot.cell.clone();
        let adapter = self.adapter.clone();

        tracing::debug!(
            backend = %self.backend,
            descriptor = %redact(&pending.task.descriptor),
            query = %pending.task.prepared_query,
            "Dispatching query"
        );

        self.work.push(
            async move {
                let outcome = execute_physical(adapter, cell, &pending.task).await;
                Completion::Executed {
                    leader: pending,
                    generation,
                    outcome,
                }
            }
            .boxed(),
        );
    }

    fn complete(&mut self, completion: Completion) {
        let (leader, generation, outcome) = match completion {
            Completion::Executed {
                leader,
                generation,
                outcome,
            } => (leader, generation, outcome),
            Completion::Closed { descriptor } => {
                tracing::info!(backend = %self.backend, descriptor = %redact(&descriptor), "Connection closed");
                return;
            }
        };
        let descriptor = leader.task.descriptor.clone();
        let fingerprint = leader.fingerprint.clone();

        self.running -= 1;
        if let Some(count) = self.running_per_descriptor.get_mut(&descriptor) {
            *count -= 1;
            if *count == 0 {
                self.running_per_descriptor.remove(&descriptor);
            }
        }
        if let Some(index) = self
            .in_flight
            .iter()
            .position(|(d, f)| *d == descriptor && *f == fingerprint)
        {
            self.in_flight.swap_remove(index);
        }

        let connection_lost = matches!(&outcome, Err(e) if e.kind == TaskErrorKind::Connect);
        let mut recipients = vec![leader];
        let mut index = 0;
        while index < self.queue.len() {
            let pending = &self.queue[index];
            let shares = pending.task.descriptor == descriptor
                && (connection_lost || pending.fingerprint == fingerprint);
            if shares {
                if let Some(pending) = self.queue.remove(index) {
                    recipients.push(pending);
                }
            } else {
                index += 1;
            }
        }

        match &outcome {
            Ok(rows) => tracing::debug!(
                backend = %self.backend,
                rows = rows.len(),
                tasks = recipients.len(),
                "Sharing query result"
            ),
            Err(e) => tracing::warn!(
                backend = %self.backend,
                descriptor = %redact(&descriptor),
                tasks = recipients.len(),
                error = %e,
                "Query execution failed"
            ),
        }

        for pending in recipients {
            let result = match &outcome {
                Ok(rows) => Ok(reconcile(rows, &pending.task.keybindings)),
                Err(e) => Err(e.clone()),
            };
            // The submitter may have stopped waiting.
            let _ = pending.reply.send(result);
        }

        if outcome.is_err() {
            self.discard_connection(&descriptor, generation);
        }

        if let Some(position) = self.queue.iter().position(|p| p.task.descriptor == descriptor) {
            if position > 0 {
                if let Some(promoted) = self.queue.remove(position) {
                    self.queue.push_front(promoted);
                }
            }
        }

        self.release_idle(&descriptor);
        self.dispatch();
    }

    fn discard_connection(&mut self, descriptor: &str, generation: u64) {
        let current = self
            .connections
            .get(descriptor)
            .is_some_and(|slot| slot.generation == generation);
        if current {
            if let Some(slot) = self.connections.remove(descriptor) {
                self.close_slot(descriptor.to_string(), slot);
            }
        }
    }

    fn release_idle(&mut self, descriptor: &str) {
        let busy = self.running_per_descriptor.contains_key(descriptor)
            || self.queue.iter().any(|p| p.task.descriptor == descriptor);
        if !busy {
            if let Some(slot) = self.connections.remove(descriptor) {
                self.close_slot(descriptor.to_string(), slot);
            }
        }
    }

    fn close_slot(&mut self, descriptor: String, slot: Slot) {
        let Some(Ok(conn)) = slot.cell.get() else {
            return;
        };
        let conn = conn.clone();
        self.work.push(
            async move {
                conn.close().await;
                Completion::Closed { descriptor }
            }
            .boxed(),
        );
    }

    async fn close_all(&mut self) {
        for (descriptor, slot) in self.connections.drain() {
            if let Some(Ok(conn)) = slot.cell.get() {
                conn.close().await;
                tracing::info!(backend = %self.backend, descriptor = %redact(&descriptor), "Connection closed");
            }
        }
    }
}

/// Opens (or reuses) the connection and runs the prepared query under the
/// task's deadline. Expiry drops the in-flight operation.
async fn execute_physical(
    adapter: Arc<dyn BackendAdapter>,
    cell: ConnectionCell,
    task: &Task,
) -> Result<Arc<Vec<Row>>, TaskError> {
    let work = async {
        let conn = cell
            .get_or_init(|| async {
                match adapter.connect(&task.descriptor).await {
                    Ok(conn) => {
                        tracing::info!(
                            backend = adapter.name(),
                            descriptor = %redact(&task.descriptor),
                            "Connection opened"
                        );
                        Ok(Arc::from(conn))
                    }
                    Err(e) => Err(TaskError::from(&e)),
                }
            })
            .await
            .clone()?;
        conn.execute(&task.prepared_query, task.timeout)
            .await
            .map(Arc::new)
            .map_err(TaskError::from)
    };

    match tokio::time::timeout(task.timeout, work).await {
        Ok(outcome) => outcome,
        Err(_) => Err(TaskError::timeout(task.timeout)),
    }
}
