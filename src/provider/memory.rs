//! In-memory broker for testing and single-process use
//!
//! Models direct exchanges, bindings, and dead-letter routing the way an
//! AMQP broker does: publishing to a missing exchange is nacked, a message
//! with no matching binding is returned, and a reject without requeue is
//! re-routed through the queue's dead-letter exchange.

use super::{
    unknown_queue, BrokerProvider, Confirmation, Delivery, DeliveryStream, InboundMessage,
    OutboundMessage, PendingConfirm,
};
use crate::error::{AuditError, Result};
use crate::topology::{validate_declarations, BindingSpec, ExchangeSpec, QueueSpec, Topology};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

#[derive(Debug, Clone)]
struct StoredMessage {
    correlation_id: Option<String>,
    attempt_count: u32,
    death_reason: Option<String>,
    body: Bytes,
}

struct MemoryQueue {
    spec: QueueSpec,
    ready: VecDeque<StoredMessage>,
    unacked: usize,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, MemoryQueue>,
    bindings: HashSet<BindingSpec>,
}

impl BrokerState {
    /// Push a message to every queue bound to `exchange` with `routing_key`
    fn route(&mut self, exchange: &str, routing_key: &str, message: StoredMessage) -> usize {
        let targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && b.routing_key == routing_key)
            .map(|b| b.queue.clone())
            .collect();

        for name in &targets {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.ready.push_back(message.clone());
                queue.notify.notify_one();
            }
        }
        targets.len()
    }
}

/// In-memory broker
///
/// Cloning shares the same broker state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a broker outage: publishes fail until re-enabled
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Messages delivered but not yet acked, requeued, or rejected
    pub fn unacked(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.unacked)
            .unwrap_or(0)
    }

    /// Snapshot ready messages in a queue without consuming them
    pub fn peek(&self, queue: &str) -> Vec<InboundMessage> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| {
                q.ready
                    .iter()
                    .map(|m| to_inbound(queue, m.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // A poisoned lock only means another task panicked mid-update;
        // the queues themselves are still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn to_inbound(queue: &str, message: StoredMessage) -> InboundMessage {
    InboundMessage {
        queue: queue.to_string(),
        correlation_id: message.correlation_id,
        attempt_count: message.attempt_count,
        death_reason: message.death_reason,
        body: message.body,
    }
}

#[async_trait]
impl BrokerProvider for MemoryBroker {
    async fn declare(&self, topology: &Topology) -> Result<()> {
        topology.validate()?;
        let exchanges = topology.exchanges();
        let queues = topology.queues();
        let bindings = topology.bindings();
        validate_declarations(&exchanges, &queues, &bindings)?;

        let mut state = self.lock();

        // Check everything before applying anything
        for exchange in &exchanges {
            if let Some(existing) = state.exchanges.get(&exchange.name) {
                if existing != exchange {
                    return Err(AuditError::Topology(format!(
                        "exchange '{}' already declared with different arguments",
                        exchange.name
                    )));
                }
            }
        }
        for queue in &queues {
            if let Some(existing) = state.queues.get(&queue.name) {
                if existing.spec != *queue {
                    return Err(AuditError::Topology(format!(
                        "queue '{}' already declared with different arguments",
                        queue.name
                    )));
                }
            }
        }

        for exchange in exchanges {
            state.exchanges.entry(exchange.name.clone()).or_insert(exchange);
        }
        for queue in queues {
            state
                .queues
                .entry(queue.name.clone())
                .or_insert_with(|| MemoryQueue {
                    spec: queue,
                    ready: VecDeque::new(),
                    unacked: 0,
                    notify: Arc::new(Notify::new()),
                });
        }
        state.bindings.extend(bindings);

        tracing::info!(
            exchange = %topology.exchange,
            work_queue = %topology.work_queue,
            dlq = %topology.dlq_queue,
            "Memory broker topology declared"
        );
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> Result<PendingConfirm> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AuditError::Connection("memory broker unavailable".to_string()));
        }

        let mut state = self.lock();
        let confirmation = if !state.exchanges.contains_key(&message.exchange) {
            Confirmation::Nack {
                reason: format!("no exchange '{}'", message.exchange),
            }
        } else {
            let stored = StoredMessage {
                correlation_id: Some(message.correlation_id.clone()),
                attempt_count: message.attempt_count,
                death_reason: None,
                body: message.body.clone(),
            };
            match state.route(&message.exchange, &message.routing_key, stored) {
                0 => Confirmation::Returned {
                    exchange: message.exchange.clone(),
                    routing_key: message.routing_key.clone(),
                    reply_text: "NO_ROUTE".to_string(),
                },
                _ => Confirmation::Ack,
            }
        };

        Ok(Box::pin(futures::future::ready(confirmation)))
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn DeliveryStream>> {
        let notify = self
            .lock()
            .queues
            .get(queue)
            .map(|q| q.notify.clone())
            .ok_or_else(|| unknown_queue(queue))?;

        Ok(Box::new(MemoryDeliveryStream {
            broker: self.clone(),
            queue: queue.to_string(),
            notify,
        }))
    }

    async fn queue_depth(&self, queue: &str) -> Result<u64> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len() as u64)
            .ok_or_else(|| unknown_queue(queue))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Delivery stream over one in-memory queue
pub struct MemoryDeliveryStream {
    broker: MemoryBroker,
    queue: String,
    notify: Arc<Notify>,
}

impl MemoryDeliveryStream {
    fn try_pop(&self) -> Option<StoredMessage> {
        let mut state = self.broker.lock();
        let queue = state.queues.get_mut(&self.queue)?;
        let message = queue.ready.pop_front()?;
        queue.unacked += 1;
        Some(message)
    }

    fn delivery(&self, message: StoredMessage) -> Delivery {
        let inbound = to_inbound(&self.queue, message.clone());

        let ack_broker = self.broker.clone();
        let ack_queue = self.queue.clone();
        let requeue_broker = self.broker.clone();
        let requeue_queue = self.queue.clone();
        let requeued = message.clone();
        let reject_broker = self.broker.clone();
        let reject_queue = self.queue.clone();

        Delivery::new(
            inbound,
            move || {
                Box::pin(async move {
                    settle(&mut ack_broker.lock(), &ack_queue);
                    Ok(())
                })
            },
            move |attempt_count| {
                Box::pin(async move {
                    let mut state = requeue_broker.lock();
                    settle(&mut state, &requeue_queue);
                    let queue = state
                        .queues
                        .get_mut(&requeue_queue)
                        .ok_or_else(|| unknown_queue(&requeue_queue))?;
                    queue.ready.push_back(StoredMessage {
                        attempt_count,
                        ..requeued
                    });
                    queue.notify.notify_one();
                    Ok(())
                })
            },
            move |reason| {
                Box::pin(async move {
                    let mut state = reject_broker.lock();
                    settle(&mut state, &reject_queue);
                    let target = state
                        .queues
                        .get(&reject_queue)
                        .and_then(|q| q.spec.dead_letter.clone());

                    let Some(target) = target else {
                        tracing::warn!(
                            queue = %reject_queue,
                            reason = %reason,
                            "Rejected message dropped: queue has no dead-letter exchange"
                        );
                        return Ok(());
                    };

                    let dead = StoredMessage {
                        death_reason: Some(reason.clone()),
                        ..message
                    };
                    if state.route(&target.exchange, &target.routing_key, dead) == 0 {
                        tracing::warn!(
                            queue = %reject_queue,
                            dlx = %target.exchange,
                            routing_key = %target.routing_key,
                            "Rejected message dropped: dead-letter route has no queue"
                        );
                    }
                    Ok(())
                })
            },
        )
    }
}

fn settle(state: &mut BrokerState, queue: &str) {
    if let Some(q) = state.queues.get_mut(queue) {
        q.unacked = q.unacked.saturating_sub(1);
    }
}

#[async_trait]
impl DeliveryStream for MemoryDeliveryStream {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        loop {
            if let Some(message) = self.try_pop() {
                return Ok(Some(self.delivery(message)));
            }
            // Permits from notify_one are stored, so a push racing with
            // this check still wakes us.
            self.notify.notified().await;
        }
    }
}
