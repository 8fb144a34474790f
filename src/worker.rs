// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Worker
//!
//! A worker owns the consumer loop of one queue. The loop runs on its own task with a
//! dedicated `QueueClient`: it drains the queue through its message handler and, when
//! a pass received nothing, sleeps until the poll timeout elapses or `stop` wakes it.
//!
//! Lifecycle changes go through compare-and-swap transitions of the worker status, so
//! concurrent `start`/`stop` calls have a single winner. A task that doesn't exit on
//! its own is reclaimed with escalating timeouts: a grace period, then an abort.

use crate::{
    client::QueueClient,
    errors::AmqpError,
    factory::MessageFactory,
    handler::{panic_message, HandlerStats, MessageHandler, MessageHandlerFactory},
    status::{Status, StatusCell},
};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::{
    fmt,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::Notify,
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, error, warn};

/// Default time a worker sleeps after a pass that received no message
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(5);
/// Time given to a task to exit on its own before it is aborted
pub const RECLAIM_GRACE_PERIOD: Duration = Duration::from_millis(500);
/// Time given to an aborted task to unwind before it is abandoned
pub const RECLAIM_ABORT_TIMEOUT: Duration = Duration::from_secs(3);

/// Called with the failed worker when its consumer loop returns an error or panics.
pub type WorkerErrorHandler = Arc<dyn Fn(Arc<Worker>, AmqpError) + Send + Sync>;

/// Snapshot of a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStats {
    pub queue_name: String,
    pub status: Status,
    pub total_messages_processed: u64,
    pub last_msg_processed: Option<DateTime<Utc>>,
    pub stats: HandlerStats,
}

impl fmt::Display for WorkerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Worker on {} ({}):", self.queue_name, self.status)?;
        writeln!(f, "  TotalMessagesReceived:          {}", self.total_messages_processed)?;
        match self.last_msg_processed {
            Some(date) => writeln!(f, "  LastMessageReceived:            {}", date.to_rfc3339())?,
            None => writeln!(f, "  LastMessageReceived:            ")?,
        }
        write!(f, "{}", self.stats)
    }
}

/// Waits for `handle` to finish, aborting it after the grace period and abandoning it
/// if the abort doesn't complete either.
pub(crate) async fn reclaim_task(mut handle: JoinHandle<()>, name: &str) {
    if timeout(RECLAIM_GRACE_PERIOD, &mut handle).await.is_ok() {
        return;
    }

    warn!(task = name, "task didn't stop in time, aborting it");
    handle.abort();

    if timeout(RECLAIM_ABORT_TIMEOUT, &mut handle).await.is_err() {
        error!(task = name, "task won't die, abandoning it");
    }
}

pub struct Worker {
    queue_name: String,
    factory: MessageFactory,
    handler_factory: Arc<dyn MessageHandlerFactory>,
    handler: Arc<dyn MessageHandler>,
    error_handler: WorkerErrorHandler,
    poll_timeout: Duration,
    status: StatusCell,
    wake: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
    total_messages_processed: AtomicU64,
    last_msg_processed: Mutex<Option<DateTime<Utc>>>,
}

impl Worker {
    pub fn new(
        queue_name: &str,
        factory: MessageFactory,
        handler_factory: Arc<dyn MessageHandlerFactory>,
        error_handler: WorkerErrorHandler,
        poll_timeout: Duration,
    ) -> Arc<Worker> {
        Arc::new(Worker {
            queue_name: queue_name.to_owned(),
            handler: handler_factory.create_message_handler(),
            factory,
            handler_factory,
            error_handler,
            poll_timeout,
            status: StatusCell::default(),
            wake: Notify::new(),
            task: Mutex::new(None),
            total_messages_processed: AtomicU64::new(0),
            last_msg_processed: Mutex::new(None),
        })
    }

    /// A new, stopped worker for the same queue with a fresh handler.
    pub fn clone_worker(&self) -> Arc<Worker> {
        Worker::new(
            &self.queue_name,
            self.factory.clone(),
            self.handler_factory.clone(),
            self.error_handler.clone(),
            self.poll_timeout,
        )
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn status(&self) -> Status {
        self.status.get()
    }

    /// Spawns the consumer loop.
    ///
    /// A started worker is left as it is. A stopping worker has its task reclaimed first.
    pub async fn start(self: &Arc<Self>) -> Result<(), AmqpError> {
        match self.status.get() {
            Status::Started => return Ok(()),
            Status::Disposed => {
                return Err(AmqpError::Disposed(format!("worker {}", self.queue_name)))
            }
            Status::Stopping => {
                self.reclaim().await;
                self.status.transition(Status::Stopping, Status::Stopped);
            }
            _ => {}
        }

        if !self.status.transition(Status::Stopped, Status::Starting) {
            return Ok(());
        }

        debug!(queue = self.queue_name.as_str(), "starting worker");

        let worker = self.clone();
        let mut task = self.task.lock();
        *task = Some(tokio::spawn(async move { worker.run().await }));

        Ok(())
    }

    async fn run(self: Arc<Self>) {
        if !self.status.transition(Status::Starting, Status::Started) {
            // stopped before the loop began
            self.status.transition(Status::Stopping, Status::Stopped);
            return;
        }

        let mut client = self.factory.create_message_queue_client();
        let result = AssertUnwindSafe(self.consume(&mut client))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                Err(AmqpError::WorkerPanicked(
                    self.queue_name.clone(),
                    panic_message(payload.as_ref()),
                ))
            });
        client.dispose().await;

        match result {
            Ok(()) => {
                self.status.transition(Status::Stopping, Status::Stopped);
                debug!(queue = self.queue_name.as_str(), "worker stopped");
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = self.queue_name.as_str(),
                    "worker faulted"
                );
                if !self.status.transition(Status::Started, Status::Stopped) {
                    self.status.transition(Status::Stopping, Status::Stopped);
                }
                (self.error_handler)(self.clone(), err);
            }
        }
    }

    async fn consume(&self, client: &mut QueueClient) -> Result<(), AmqpError> {
        let keep_going = || self.status.get() == Status::Started;

        while keep_going() {
            let received = self
                .handler
                .process_queue(client, &self.queue_name, &keep_going)
                .await?;

            if received > 0 {
                self.total_messages_processed
                    .fetch_add(received, Ordering::Relaxed);
                *self.last_msg_processed.lock() = Some(Utc::now());
                continue;
            }

            if keep_going() {
                tokio::select! {
                    _ = self.wake.notified() => {}
                    _ = sleep(self.poll_timeout) => {}
                }
            }
        }

        Ok(())
    }

    /// Asks the consumer loop to exit and wakes it if it is sleeping.
    ///
    /// The message being processed, if any, is settled before the loop exits.
    pub fn stop(&self) {
        if self.status.get() == Status::Disposed {
            return;
        }

        if self.status.transition(Status::Started, Status::Stopping)
            || self.status.transition(Status::Starting, Status::Stopping)
        {
            debug!(queue = self.queue_name.as_str(), "stopping worker");
            self.wake.notify_one();
        }
    }

    /// Stops the worker, reclaims its task and marks it disposed. Calling it twice is a no-op.
    pub async fn dispose(&self) {
        if self.status.get() == Status::Disposed {
            return;
        }

        self.stop();
        self.reclaim().await;

        if self.status.replace(Status::Disposed) != Status::Disposed {
            debug!(queue = self.queue_name.as_str(), "worker disposed");
        }
    }

    async fn reclaim(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            reclaim_task(handle, &self.queue_name).await;
        }
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            queue_name: self.queue_name.clone(),
            status: self.status.get(),
            total_messages_processed: self.total_messages_processed.load(Ordering::Relaxed),
            last_msg_processed: *self.last_msg_processed.lock(),
            stats: self.handler.stats(),
        }
    }
}
