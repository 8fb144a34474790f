// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

#![allow(dead_code)]

//! In-memory broker used by the integration tests.
//!
//! It models the parts of RabbitMQ the server relies on: exact-match routing through
//! bindings, unacked deliveries returned to their queue with the redelivered flag when
//! nacked with requeue or when their channel goes away, dead-lettering on nack without
//! requeue, and 404 replies (which close the channel) on gets from unknown queues.

use async_trait::async_trait;
use lapin::BasicProperties;
use parking_lot::Mutex;
use rabbitmq_mq::{
    channel::{BrokerChannel, ChannelProvider},
    codec::WireMessage,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    factory::MessageFactory,
    queue::{QueueBinding, QueueDefinition},
};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

#[derive(Clone)]
struct Stored {
    properties: BasicProperties,
    data: Vec<u8>,
    redelivered: bool,
}

struct QueueState {
    def: QueueDefinition,
    messages: VecDeque<Stored>,
}

struct Unacked {
    channel: u64,
    queue: String,
    msg: Stored,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashSet<String>,
    queues: HashMap<String, QueueState>,
    bindings: HashMap<(String, String), Vec<String>>,
    unacked: HashMap<u64, Unacked>,
    next_tag: u64,
    declares: HashMap<String, usize>,
    get_failures: HashMap<String, usize>,
    declare_failures: usize,
    declare_delay: Duration,
    published: usize,
}

impl BrokerState {
    fn route(&mut self, exchange: &str, routing_key: &str, msg: Stored) {
        let Some(queues) = self
            .bindings
            .get(&(exchange.to_owned(), routing_key.to_owned()))
            .cloned()
        else {
            return;
        };

        for queue in queues {
            if let Some(state) = self.queues.get_mut(&queue) {
                state.messages.push_back(msg.clone());
            }
        }
    }

    fn return_unacked(&mut self, tag: u64) {
        let Some(unacked) = self.unacked.remove(&tag) else {
            return;
        };

        if let Some(state) = self.queues.get_mut(&unacked.queue) {
            state.messages.push_front(Stored {
                redelivered: true,
                ..unacked.msg
            });
        }
    }

    fn return_channel(&mut self, channel: u64) {
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel == channel)
            .map(|(tag, _)| *tag)
            .collect();
        // newest first so the oldest ends up at the head of the queue
        tags.sort_unstable_by(|a, b| b.cmp(a));

        for tag in tags {
            self.return_unacked(tag);
        }
    }
}

#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    next_channel: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl InMemoryBroker {
    pub fn new() -> InMemoryBroker {
        InMemoryBroker::default()
    }

    pub fn factory(&self) -> MessageFactory {
        MessageFactory::new(Arc::new(self.clone()))
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.state.lock().queues.contains_key(queue)
    }

    pub fn queue_count(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .queues
            .keys()
            .filter(|q| q.starts_with(prefix))
            .count()
    }

    /// Ready messages, unacked deliveries excluded.
    pub fn message_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or_default()
    }

    pub fn unacked_count(&self) -> usize {
        self.state.lock().unacked.len()
    }

    /// Ready messages of `queue`, left in place.
    pub fn peek(&self, queue: &str) -> Vec<WireMessage> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| {
                q.messages
                    .iter()
                    .map(|m| WireMessage {
                        delivery_tag: 0,
                        redelivered: m.redelivered,
                        properties: m.properties.clone(),
                        data: m.data.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn declare_count(&self, queue: &str) -> usize {
        self.state.lock().declares.get(queue).copied().unwrap_or_default()
    }

    pub fn published_count(&self) -> usize {
        self.state.lock().published
    }

    /// Makes the next `times` gets on `queue` fail with a channel error.
    pub fn fail_gets(&self, queue: &str, times: usize) {
        self.state.lock().get_failures.insert(queue.to_owned(), times);
    }

    /// Makes the next `times` queue declarations fail.
    pub fn fail_declares(&self, times: usize) {
        self.state.lock().declare_failures = times;
    }

    /// Makes every later queue declaration take `delay`.
    pub fn delay_declares(&self, delay: Duration) {
        self.state.lock().declare_delay = delay;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelProvider for InMemoryBroker {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if self.is_closed() {
            return Err(AmqpError::Disposed("connection".to_owned()));
        }

        Ok(Arc::new(InMemoryChannel {
            id: self.next_channel.fetch_add(1, Ordering::SeqCst),
            state: self.state.clone(),
            open: AtomicBool::new(true),
        }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct InMemoryChannel {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
    open: AtomicBool,
}

impl InMemoryChannel {
    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AmqpError::ChannelError)
        }
    }

    fn shutdown(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.state.lock().return_channel(self.id);
        }
    }
}

impl Drop for InMemoryChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.state.lock().exchanges.insert(def.name().to_owned());
        Ok(())
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let delay = self.state.lock().declare_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;

        if state.declare_failures > 0 {
            state.declare_failures -= 1;
            return Err(AmqpError::DeclareQueueError(def.name().to_owned()));
        }

        *state.declares.entry(def.name().to_owned()).or_default() += 1;

        match state.queues.get(def.name()) {
            Some(existing) if existing.def != *def => {
                Err(AmqpError::PreconditionFailed(def.name().to_owned()))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    def.name().to_owned(),
                    QueueState {
                        def: def.clone(),
                        messages: VecDeque::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if !state.queues.contains_key(binding.queue_name()) {
            return Err(AmqpError::NotFound(binding.queue_name().to_owned()));
        }

        let queues = state
            .bindings
            .entry((binding.exchange_name().to_owned(), binding.key().to_owned()))
            .or_default();
        if !queues.iter().any(|q| q == binding.queue_name()) {
            queues.push(binding.queue_name().to_owned());
        }

        Ok(())
    }

    async fn basic_qos(&self, _prefetch_count: u16) -> Result<(), AmqpError> {
        self.ensure_open()
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.state.lock();

        state.published += 1;
        state.route(
            exchange,
            routing_key,
            Stored {
                properties,
                data: payload.to_vec(),
                redelivered: false,
            },
        );

        Ok(())
    }

    async fn basic_get(&self, queue: &str) -> Result<Option<WireMessage>, AmqpError> {
        self.ensure_open()?;

        let not_found = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            if let Some(failures) = state.get_failures.get_mut(queue) {
                if *failures > 0 {
                    *failures -= 1;
                    return Err(AmqpError::GetMessageError(queue.to_owned()));
                }
            }

            match state.queues.get_mut(queue) {
                None => true,
                Some(q) => {
                    let Some(msg) = q.messages.pop_front() else {
                        return Ok(None);
                    };

                    state.next_tag += 1;
                    let tag = state.next_tag;
                    let wire = WireMessage {
                        delivery_tag: tag,
                        redelivered: msg.redelivered,
                        properties: msg.properties.clone(),
                        data: msg.data.clone(),
                    };
                    state.unacked.insert(
                        tag,
                        Unacked {
                            channel: self.id,
                            queue: queue.to_owned(),
                            msg,
                        },
                    );

                    return Ok(Some(wire));
                }
            }
        };

        if not_found {
            // like RabbitMQ, a 404 closes the channel
            self.shutdown();
        }
        Err(AmqpError::NotFound(queue.to_owned()))
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.ensure_open()?;

        match self.state.lock().unacked.remove(&delivery_tag) {
            Some(_) => Ok(()),
            None => Err(AmqpError::AckMessageError),
        }
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if requeue {
            if !state.unacked.contains_key(&delivery_tag) {
                return Err(AmqpError::NackMessageError);
            }
            state.return_unacked(delivery_tag);
            return Ok(());
        }

        let Some(unacked) = state.unacked.remove(&delivery_tag) else {
            return Err(AmqpError::NackMessageError);
        };

        let dead_letter = state.queues.get(&unacked.queue).and_then(|q| {
            q.def.dead_letter_exchange().map(|exchange| {
                (
                    exchange.to_owned(),
                    q.def
                        .dead_letter_routing_key()
                        .unwrap_or(&unacked.queue)
                        .to_owned(),
                )
            })
        });

        if let Some((exchange, routing_key)) = dead_letter {
            state.route(&exchange, &routing_key, unacked.msg);
        }

        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.shutdown();
        Ok(())
    }
}

/// Polls `check` every 10ms until it holds or `within` elapses.
pub async fn eventually(within: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;

    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    check()
}
