// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # MQ Server
//!
//! The server supervises one worker per configured thread for every registered message
//! type and queue (`.inq`, plus `.priorityq` unless the type is excluded by the priority
//! whitelist). Its lifecycle mirrors the worker state machine:
//!
//! - `start` declares the queue topology once, starts every worker and spawns the control
//!   task
//! - `stop` and `restart` store the requested operation in a single pending slot and wake
//!   the control task, which applies it. Concurrent requests coalesce, the last one wins
//! - a worker that faults is replaced by a fresh clone, the failed one is disposed
//! - a control task that faults stops every worker, reports the error and, when a
//!   keep-alive interval is configured, resumes itself after that interval
//!
//! ## Example
//! ```rust,no_run
//! use rabbitmq_mq::{configs::RabbitMqConfigs, envelope::{Envelope, MessageBody}, handler::HandlerResult};
//! use rabbitmq_mq::server::{MqServer, ServerOptions};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct OrderPlaced {
//!     id: String,
//! }
//!
//! impl MessageBody for OrderPlaced {}
//!
//! async fn on_order(env: Envelope<OrderPlaced>) -> HandlerResult {
//!     println!("order {}", env.body.id);
//!     Ok(None)
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let server = MqServer::connect(&RabbitMqConfigs::from_env()?, ServerOptions::new())?;
//! server.register_handler(on_order)?;
//! server.start().await?;
//! # Ok(())
//! # }
//! ```

use crate::{
    channel::{open_channel, BrokerChannel},
    client::QueueClient,
    codec::WireMessage,
    configs::RabbitMqConfigs,
    envelope::{Envelope, MessageBody, Reply},
    errors::AmqpError,
    factory::MessageFactory,
    handler::{
        ErrorCallback, HandlerDefaults, HandlerResult, HandlerStats, RequestFilter, ResponseFilter,
    },
    producer::Producer,
    queue::QueueNames,
    registry::{HandlerRegistration, HandlerRegistry},
    status::{Status, StatusCell, WorkerOperation},
    topology::register_queues,
    worker::{
        reclaim_task, Worker, WorkerErrorHandler, WorkerStats, DEFAULT_POLL_TIMEOUT,
        RECLAIM_GRACE_PERIOD,
    },
};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use std::{
    fmt::Write,
    future::Future,
    mem,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::Notify,
    task::JoinHandle,
    time::{sleep, Instant},
};
use tracing::{debug, error, info, warn};

/// Interval at which `start` checks whether a pending stop or restart was applied
const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Receives every error of the control task and of the workers.
pub type ServerErrorHandler = Arc<dyn Fn(&AmqpError) + Send + Sync>;

/// Settings of a `MqServer`.
#[derive(Clone)]
pub struct ServerOptions {
    retry_count: u32,
    priority_queues_whitelist: Option<Vec<String>>,
    publish_responses_whitelist: Option<Vec<String>>,
    disable_publishing_to_outq: bool,
    poll_timeout: Duration,
    keep_alive_retry_after: Option<Duration>,
    prefetch_count: Option<u16>,
    request_filter: Option<RequestFilter>,
    response_filter: Option<ResponseFilter>,
    error_handler: Option<ServerErrorHandler>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            retry_count: 1,
            priority_queues_whitelist: None,
            publish_responses_whitelist: None,
            disable_publishing_to_outq: false,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            keep_alive_retry_after: None,
            prefetch_count: None,
            request_filter: None,
            response_filter: None,
            error_handler: None,
        }
    }
}

impl ServerOptions {
    pub fn new() -> ServerOptions {
        ServerOptions::default()
    }

    /// Number of redeliveries before a failing message is dead-lettered: 0 or 1.
    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Types that get priority queue workers. `None` means every type, an empty list none.
    pub fn priority_queues_whitelist(mut self, types: Vec<String>) -> Self {
        self.priority_queues_whitelist = Some(types);
        self
    }

    /// Response types that are published to their `.inq`. `None` means every type.
    pub fn publish_responses_whitelist(mut self, types: Vec<String>) -> Self {
        self.publish_responses_whitelist = Some(types);
        self
    }

    pub fn disable_publishing_to_outq(mut self) -> Self {
        self.disable_publishing_to_outq = true;
        self
    }

    pub fn poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn keep_alive_retry_after(mut self, after: Duration) -> Self {
        self.keep_alive_retry_after = Some(after);
        self
    }

    pub fn prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = Some(prefetch_count);
        self
    }

    pub fn request_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&mut WireMessage) -> bool + Send + Sync + 'static,
    {
        self.request_filter = Some(Arc::new(filter));
        self
    }

    pub fn response_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(Reply) -> Reply + Send + Sync + 'static,
    {
        self.response_filter = Some(Arc::new(filter));
        self
    }

    pub fn error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&AmqpError) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }
}

fn validate_retry_count(retry_count: u32) -> Result<u32, AmqpError> {
    // the redelivered flag only tells a first delivery from a later one
    if retry_count > 1 {
        return Err(AmqpError::InvalidRetryCount(retry_count));
    }
    Ok(retry_count)
}

/// Supervisor of the workers of every registered message type.
#[derive(Clone)]
pub struct MqServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    factory: MessageFactory,
    defaults: Mutex<HandlerDefaults>,
    registry: Mutex<HandlerRegistry>,
    workers: RwLock<Vec<Arc<Worker>>>,
    init_lock: tokio::sync::Mutex<()>,
    initialized: AtomicBool,
    status: StatusCell,
    pending: Mutex<WorkerOperation>,
    signal: Notify,
    control: Mutex<Option<JoinHandle<()>>>,
    times_started: AtomicU64,
    bg_task_count: AtomicU64,
    num_errors: AtomicU64,
    continuous_errors: AtomicU64,
    last_error: Mutex<Option<String>>,
    poll_timeout: Duration,
    keep_alive_retry_after: Option<Duration>,
    priority_queues_whitelist: Option<Vec<String>>,
    error_handler: ServerErrorHandler,
}

impl MqServer {
    pub fn new(factory: MessageFactory, options: ServerOptions) -> Result<MqServer, AmqpError> {
        let retry_count = validate_retry_count(options.retry_count)?;

        let factory = match options.prefetch_count {
            Some(prefetch_count) => factory.prefetch_count(prefetch_count),
            None => factory,
        };

        let defaults = HandlerDefaults {
            retry_count,
            request_filter: options.request_filter,
            response_filter: options.response_filter,
            publish_responses_whitelist: options.publish_responses_whitelist,
            publish_to_outq: !options.disable_publishing_to_outq,
        };

        let error_handler: ServerErrorHandler = match options.error_handler {
            Some(handler) => handler,
            None => Arc::new(|err: &AmqpError| error!(error = err.to_string(), "mq server error")),
        };

        Ok(MqServer {
            inner: Arc::new(ServerInner {
                factory,
                defaults: Mutex::new(defaults),
                registry: Mutex::new(HandlerRegistry::new()),
                workers: RwLock::new(vec![]),
                init_lock: tokio::sync::Mutex::new(()),
                initialized: AtomicBool::new(false),
                status: StatusCell::default(),
                pending: Mutex::new(WorkerOperation::NoOp),
                signal: Notify::new(),
                control: Mutex::new(None),
                times_started: AtomicU64::new(0),
                bg_task_count: AtomicU64::new(0),
                num_errors: AtomicU64::new(0),
                continuous_errors: AtomicU64::new(0),
                last_error: Mutex::new(None),
                poll_timeout: options.poll_timeout,
                keep_alive_retry_after: options.keep_alive_retry_after,
                priority_queues_whitelist: options.priority_queues_whitelist,
                error_handler,
            }),
        })
    }

    /// Server over a `lapin` connection to the configured broker.
    pub fn connect(cfg: &RabbitMqConfigs, options: ServerOptions) -> Result<MqServer, AmqpError> {
        MqServer::new(MessageFactory::connect(cfg), options)
    }

    /// Registers `handler` for `T` with one worker per queue.
    pub fn register_handler<T, F, Fut>(&self, handler: F) -> Result<(), AmqpError>
    where
        T: MessageBody + DeserializeOwned + Clone,
        F: Fn(Envelope<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_handler_with(handler, None, 1)
    }

    /// Registers `handler` for `T` with `thread_count` workers per queue. The server
    /// defaults in effect now are the ones the handler keeps.
    pub fn register_handler_with<T, F, Fut>(
        &self,
        handler: F,
        error_callback: Option<ErrorCallback<T>>,
        thread_count: usize,
    ) -> Result<(), AmqpError>
    where
        T: MessageBody + DeserializeOwned + Clone,
        F: Fn(Envelope<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let defaults = self.inner.defaults.lock().clone();
        self.inner
            .registry
            .lock()
            .register(&defaults, handler, error_callback, thread_count)
    }

    pub fn set_retry_count(&self, retry_count: u32) -> Result<(), AmqpError> {
        self.inner.defaults.lock().retry_count = validate_retry_count(retry_count)?;
        Ok(())
    }

    pub fn set_request_filter<F>(&self, filter: F)
    where
        F: Fn(&mut WireMessage) -> bool + Send + Sync + 'static,
    {
        self.inner.defaults.lock().request_filter = Some(Arc::new(filter));
    }

    pub fn set_response_filter<F>(&self, filter: F)
    where
        F: Fn(Reply) -> Reply + Send + Sync + 'static,
    {
        self.inner.defaults.lock().response_filter = Some(Arc::new(filter));
    }

    pub fn set_publish_responses_whitelist(&self, types: Option<Vec<String>>) {
        self.inner.defaults.lock().publish_responses_whitelist = types;
    }

    /// Declares the queues of every registered type and builds the workers. Later calls
    /// are no-ops, and no handler can be registered afterwards.
    pub async fn init(&self) -> Result<(), AmqpError> {
        self.inner.init().await
    }

    pub async fn start(&self) -> Result<(), AmqpError> {
        self.inner.start().await
    }

    pub fn stop(&self) -> Result<(), AmqpError> {
        self.inner.request(WorkerOperation::Stop)
    }

    pub fn restart(&self) -> Result<(), AmqpError> {
        self.inner.request(WorkerOperation::Restart)
    }

    /// Stops the server, disposes every worker and closes the connection. Terminal.
    pub async fn dispose(&self) {
        self.inner.dispose().await
    }

    pub fn status(&self) -> Status {
        self.inner.status.get()
    }

    /// Counters of every worker handler added together.
    pub fn stats(&self) -> HandlerStats {
        let mut total = HandlerStats::new("All Handlers");
        for worker in self.worker_stats() {
            total.add(&worker.stats);
        }
        total
    }

    pub fn worker_stats(&self) -> Vec<WorkerStats> {
        self.inner.workers.read().iter().map(|w| w.stats()).collect()
    }

    pub fn stats_description(&self) -> String {
        let inner = &self.inner;
        let workers = inner.workers.read().clone();
        let listening_on = workers
            .iter()
            .map(|w| w.queue_name())
            .collect::<Vec<_>>()
            .join(", ");

        let mut text = String::new();
        let _ = writeln!(text, "#MQ SERVER STATS:");
        let _ = writeln!(text, "===============");
        let _ = writeln!(text, "Current Status: {}", inner.status.get());
        let _ = writeln!(text, "Listening On: {listening_on}");
        let _ = writeln!(text, "Times Started: {}", inner.times_started.load(Ordering::Relaxed));
        let _ = writeln!(text, "Num of Errors: {}", inner.num_errors.load(Ordering::Relaxed));
        let _ = writeln!(
            text,
            "Num of Continuous Errors: {}",
            inner.continuous_errors.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            text,
            "Last ErrorMsg: {}",
            inner.last_error.lock().as_deref().unwrap_or_default()
        );
        let _ = writeln!(text, "===============");

        for worker in workers {
            let _ = writeln!(text, "{}", worker.stats());
            let _ = writeln!(text, "---------------");
        }

        text
    }

    pub fn registered_types(&self) -> Vec<String> {
        self.inner.registry.lock().registered_types()
    }

    /// Number of control tasks spawned so far.
    pub fn bg_task_count(&self) -> u64 {
        self.inner.bg_task_count.load(Ordering::Relaxed)
    }

    pub fn times_started(&self) -> u64 {
        self.inner.times_started.load(Ordering::Relaxed)
    }

    pub fn create_producer(&self) -> Producer {
        self.inner.factory.create_producer()
    }

    pub fn create_message_queue_client(&self) -> QueueClient {
        self.inner.factory.create_message_queue_client()
    }
}

impl ServerInner {
    fn priority_enabled(&self, message_type: &str) -> bool {
        match &self.priority_queues_whitelist {
            Some(types) => types.iter().any(|t| t == message_type),
            None => true,
        }
    }

    async fn init(self: &Arc<Self>) -> Result<(), AmqpError> {
        let _guard = self.init_lock.lock().await;
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        let registrations: Vec<HandlerRegistration> = {
            let mut registry = self.registry.lock();
            registry.close();
            registry.iter().cloned().collect()
        };

        if !registrations.is_empty() {
            let types: Vec<String> = registrations.iter().map(|r| r.message_type.clone()).collect();
            self.declare_topology(&types).await?;
        }

        let mut workers = vec![];
        for registration in &registrations {
            let names = QueueNames::new(&registration.message_type);

            if self.priority_enabled(&registration.message_type) {
                for _ in 0..registration.thread_count {
                    workers.push(self.new_worker(&names.priorityq, registration));
                }
            }

            for _ in 0..registration.thread_count {
                workers.push(self.new_worker(&names.inq, registration));
            }
        }

        debug!(workers = workers.len(), "mq server initialized");
        *self.workers.write() = workers;
        self.initialized.store(true, Ordering::Release);

        Ok(())
    }

    async fn declare_topology(&self, types: &[String]) -> Result<(), AmqpError> {
        let channel = open_channel(self.factory.provider.as_ref()).await?;
        let result = declare_all(channel.as_ref(), types).await;

        if let Err(err) = channel.close().await {
            warn!(error = err.to_string(), "error to close the topology channel");
        }

        result
    }

    fn new_worker(self: &Arc<Self>, queue_name: &str, registration: &HandlerRegistration) -> Arc<Worker> {
        let server = Arc::downgrade(self);
        let error_handler: WorkerErrorHandler = Arc::new(move |worker, err| {
            if let Some(server) = server.upgrade() {
                tokio::spawn(async move { server.replace_worker(worker, err).await });
            }
        });

        Worker::new(
            queue_name,
            self.factory.clone(),
            registration.factory.clone(),
            error_handler,
            self.poll_timeout,
        )
    }

    /// Swaps a faulted worker for a fresh clone, started when the server is running.
    async fn replace_worker(self: Arc<Self>, failed: Arc<Worker>, err: AmqpError) {
        error!(
            error = err.to_string(),
            queue = failed.queue_name(),
            "received exception in worker"
        );
        (self.error_handler)(&err);

        if self.status.get() == Status::Disposed {
            failed.dispose().await;
            return;
        }

        let replacement = failed.clone_worker();
        let replaced = {
            let mut workers = self.workers.write();
            match workers.iter_mut().find(|w| Arc::ptr_eq(w, &failed)) {
                Some(slot) => {
                    *slot = replacement.clone();
                    true
                }
                None => false,
            }
        };

        if replaced && self.status.get() == Status::Started {
            if let Err(err) = replacement.start().await {
                (self.error_handler)(&err);
            }
        }

        failed.dispose().await;
    }

    async fn start(self: &Arc<Self>) -> Result<(), AmqpError> {
        match self.status.get() {
            Status::Started => {
                // restart any worker that stopped on its own
                self.start_workers().await;
                return Ok(());
            }
            Status::Disposed => return Err(AmqpError::Disposed("mq server".to_owned())),
            Status::Stopping => match self.settle(RECLAIM_GRACE_PERIOD).await {
                Status::Started => {
                    // a restart completed, its control task is still serving
                    self.start_workers().await;
                    return Ok(());
                }
                Status::Disposed => return Err(AmqpError::Disposed("mq server".to_owned())),
                Status::Stopping => {
                    self.reclaim_control().await;
                    if self.status.transition(Status::Stopping, Status::Stopped) {
                        self.stop_workers();
                    } else if self.status.get() == Status::Started {
                        // the operation completed while its task was being reclaimed
                        self.spawn_control();
                        return Ok(());
                    }
                }
                _ => {}
            },
            _ => {}
        }

        if !self.status.transition(Status::Stopped, Status::Starting) {
            return Ok(());
        }

        if let Err(err) = self.init().await {
            self.status.transition(Status::Starting, Status::Stopped);
            return Err(err);
        }

        if self.workers.read().is_empty() {
            warn!("Cannot start a MQ Server with no Message Handlers registered, ignoring.");
            self.status.transition(Status::Starting, Status::Stopped);
            return Ok(());
        }

        self.start_workers().await;
        self.reclaim_control().await;
        *self.pending.lock() = WorkerOperation::NoOp;

        if !self.status.transition(Status::Starting, Status::Started) {
            return Ok(());
        }

        self.times_started.fetch_add(1, Ordering::Relaxed);
        self.continuous_errors.store(0, Ordering::Relaxed);
        self.spawn_control();

        info!("mq server started");
        Ok(())
    }

    fn spawn_control(self: &Arc<Self>) {
        self.bg_task_count.fetch_add(1, Ordering::Relaxed);

        let server = self.clone();
        *self.control.lock() = Some(tokio::spawn(async move { server.run_loop().await }));
    }

    /// Waits up to `within` for a pending stop or restart to be applied.
    async fn settle(&self, within: Duration) -> Status {
        let deadline = Instant::now() + within;

        loop {
            let status = self.status.get();
            if status != Status::Stopping || Instant::now() >= deadline {
                return status;
            }
            sleep(SETTLE_POLL_INTERVAL).await;
        }
    }

    fn request(&self, op: WorkerOperation) -> Result<(), AmqpError> {
        if self.status.get() == Status::Disposed {
            return Err(AmqpError::Disposed("mq server".to_owned()));
        }

        let mut pending = self.pending.lock();
        if self.status.transition(Status::Started, Status::Stopping)
            || self.status.get() == Status::Stopping
        {
            *pending = op;
            self.signal.notify_one();
        }

        Ok(())
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            let Err(err) = self.control_loop().await else {
                break;
            };

            error!(error = err.to_string(), "mq server control loop failed");
            *self.last_error.lock() = Some(err.to_string());
            self.num_errors.fetch_add(1, Ordering::Relaxed);
            self.continuous_errors.fetch_add(1, Ordering::Relaxed);

            self.status.set(Status::Stopped);
            self.stop_workers();
            (self.error_handler)(&err);

            let Some(after) = self.keep_alive_retry_after else {
                break;
            };

            sleep(after).await;
            if !self.resume().await {
                break;
            }
        }

        debug!("mq server control task exited");
    }

    async fn control_loop(&self) -> Result<(), AmqpError> {
        loop {
            self.signal.notified().await;
            let op = mem::take(&mut *self.pending.lock());

            match op {
                WorkerOperation::Stop => {
                    if !self.status.transition(Status::Stopping, Status::Stopped) {
                        self.status.transition(Status::Started, Status::Stopped);
                    }
                    self.stop_workers();
                    info!("mq server stopped");
                    return Ok(());
                }
                WorkerOperation::Restart => {
                    self.stop_workers();
                    let types = self.registry.lock().registered_types();
                    self.declare_topology(&types).await?;
                    self.start_workers().await;
                    self.status.transition(Status::Stopping, Status::Started);
                    info!("mq server restarted");
                }
                WorkerOperation::NoOp => {
                    if self.status.get() == Status::Disposed {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Starts the workers again from within the control task after a fault.
    async fn resume(&self) -> bool {
        if !self.status.transition(Status::Stopped, Status::Starting) {
            return false;
        }

        *self.pending.lock() = WorkerOperation::NoOp;
        self.start_workers().await;

        if !self.status.transition(Status::Starting, Status::Started) {
            return false;
        }

        self.times_started.fetch_add(1, Ordering::Relaxed);
        info!("mq server resumed");
        true
    }

    async fn start_workers(&self) {
        let workers = self.workers.read().clone();
        let results = join_all(workers.iter().map(|w| w.start())).await;

        for err in results.into_iter().filter_map(Result::err) {
            warn!(error = err.to_string(), "error to start worker");
            (self.error_handler)(&err);
        }
    }

    fn stop_workers(&self) {
        for worker in self.workers.read().iter() {
            worker.stop();
        }
    }

    async fn reclaim_control(&self) {
        let handle = self.control.lock().take();
        if let Some(handle) = handle {
            reclaim_task(handle, "mq server control").await;
        }
    }

    async fn dispose(&self) {
        if self.status.get() == Status::Disposed {
            return;
        }

        let _ = self.request(WorkerOperation::Stop);

        if self.status.replace(Status::Disposed) == Status::Disposed {
            return;
        }
        self.signal.notify_one();

        let workers = self.workers.read().clone();
        join_all(workers.iter().map(|w| w.dispose())).await;
        self.reclaim_control().await;

        if let Err(err) = self.factory.close().await {
            (self.error_handler)(&err);
        }

        info!("mq server disposed");
    }
}

async fn declare_all(channel: &dyn BrokerChannel, types: &[String]) -> Result<(), AmqpError> {
    for message_type in types {
        register_queues(channel, &QueueNames::new(message_type)).await?;
    }
    Ok(())
}
