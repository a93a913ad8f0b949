// In-process publish/subscribe channel.
//
// Every consumer group subscribed to a topic receives its own copy of each
// message published there, through an unbounded `tokio::sync::mpsc` queue.
// Publishing never blocks. Closing the bus drops every sender: consumers
// drain what is already queued and then see the end of their subscription.

use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{Result, TallyError};

pub trait MessageBus: Send + Sync {
    fn publish(&self, topic: &str, payload: Value) -> Result<()>;
}

struct GroupSender {
    group: String,
    tx: mpsc::UnboundedSender<Value>,
}

#[derive(Default)]
pub struct MemoryBus {
    topics: DashMap<String, Vec<GroupSender>>,
    closed: AtomicBool,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `group` on `topic`. Each group may hold one subscription per
    /// topic.
    pub fn subscribe(&self, topic: &str, group: &str) -> Result<Subscription> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TallyError::Channel("bus is closed".to_string()));
        }
        let mut groups = self.topics.entry(topic.to_string()).or_default();
        if groups.iter().any(|g| g.group == group && !g.tx.is_closed()) {
            return Err(TallyError::Channel(format!(
                "group {group} already subscribed to {topic}"
            )));
        }
        groups.retain(|g| g.group != group);
        let (tx, rx) = mpsc::unbounded_channel();
        groups.push(GroupSender {
            group: group.to_string(),
            tx,
        });
        tracing::debug!(topic, group, "subscribed");
        Ok(Subscription {
            topic: topic.to_string(),
            group: group.to_string(),
            rx,
        })
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.topics.clear();
        tracing::debug!("bus closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl MessageBus for MemoryBus {
    fn publish(&self, topic: &str, payload: Value) -> Result<()> {
        if self.is_closed() {
            return Err(TallyError::Channel(format!("bus is closed, cannot publish to {topic}")));
        }
        let Some(groups) = self.topics.get(topic) else {
            tracing::debug!(topic, "no subscribers, message discarded");
            return Ok(());
        };
        for g in groups.iter() {
            if g.tx.send(payload.clone()).is_err() {
                tracing::debug!(topic, group = %g.group, "subscriber gone, skipping");
            }
        }
        Ok(())
    }
}

pub struct Subscription {
    pub topic: String,
    pub group: String,
    rx: mpsc::UnboundedReceiver<Value>,
}

impl Subscription {
    /// Next payload, or `None` once the bus is closed and the queue is drained.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}
