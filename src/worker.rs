// Bus consumers. Each subscription is driven by one tokio task that decodes
// payloads and hands every message to a `Handler` on the blocking pool, since
// handlers talk to SQLite. Messages that fail validation are logged and
// dropped; nothing is retried.

use std::fmt;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::bus::{MemoryBus, MessageBus, Subscription};
use crate::correlator::Correlator;
use crate::error::Result;
use crate::messages::{
    self, Message, TaxRequest, TaxResponse, TransactionTaxRequest, TAX_CALCULATION_TOPIC,
    TAX_REQUEST_TOPIC, TAX_RESPONSE_TOPIC,
};
use crate::store::TransactionStore;
use crate::tax;

pub const TAX_CALCULATION_GROUP: &str = "tax_calculation_group";
pub const TAX_PROCESSOR_GROUP: &str = "tax_processor_group";
pub const TAX_API_GROUP: &str = "tax_api_group";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Validated,
    Computed,
    Persisted,
    Published,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Received => "RECEIVED",
            Stage::Validated => "VALIDATED",
            Stage::Computed => "COMPUTED",
            Stage::Persisted => "PERSISTED",
            Stage::Published => "PUBLISHED",
        };
        f.write_str(s)
    }
}

pub trait Handler: Send + Sync {
    fn name(&self) -> &'static str;

    fn handle(&self, message: Message) -> Result<()>;
}

/// Computes tax on stored transactions. Emits nothing.
pub struct TransactionTaxWorker {
    store: Arc<dyn TransactionStore>,
}

impl TransactionTaxWorker {
    pub fn new(store: Arc<dyn TransactionStore>) -> Self {
        Self { store }
    }

    /// Returns the tax written to the record, or `None` when the request was
    /// dropped. The amount in the request is ignored; the stored amount wins.
    pub fn process(&self, request: &TransactionTaxRequest) -> Result<Option<f64>> {
        tracing::debug!(stage = %Stage::Received, transaction_id = ?request.transaction_id);

        let Some(transaction_id) = request
            .transaction_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
        else {
            tracing::warn!("tax request without a transaction id, dropping");
            return Ok(None);
        };
        let Some(record) = self.store.find_transaction(transaction_id)? else {
            tracing::warn!(transaction_id, "no such transaction, dropping");
            return Ok(None);
        };
        let (Some(id), Some(amount)) = (record.id, record.amount) else {
            tracing::warn!(transaction_id, "transaction has no amount, dropping");
            return Ok(None);
        };
        tracing::debug!(stage = %Stage::Validated, transaction_id);

        let tax_amount = tax::tax(amount);
        tracing::debug!(stage = %Stage::Computed, transaction_id, amount, tax_amount);

        self.store.set_tax_amount(id, tax_amount)?;
        tracing::debug!(stage = %Stage::Persisted, transaction_id);
        Ok(Some(tax_amount))
    }
}

impl Handler for TransactionTaxWorker {
    fn name(&self) -> &'static str {
        "transaction-tax"
    }

    fn handle(&self, message: Message) -> Result<()> {
        match message {
            Message::TransactionTax(request) => self.process(&request).map(|_| ()),
            other => {
                tracing::warn!(kind = other.kind(), "unexpected message on {TAX_CALCULATION_TOPIC}");
                Ok(())
            }
        }
    }
}

/// Answers correlated tax requests on the response topic.
pub struct TaxRequestWorker {
    bus: Arc<dyn MessageBus>,
}

impl TaxRequestWorker {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus }
    }

    pub fn process(&self, request: TaxRequest) -> Result<Option<TaxResponse>> {
        tracing::debug!(stage = %Stage::Received, id = request.id);

        let Some(user_name) = request.user_name.filter(|u| !u.trim().is_empty()) else {
            tracing::warn!(id = request.id, "tax request without a user name, skipping");
            return Ok(None);
        };
        tracing::debug!(stage = %Stage::Validated, id = request.id);

        let tax = tax::tax(request.income);
        let response = TaxResponse {
            id: request.id,
            user_name,
            income: request.income,
            tax,
            net_income: tax::net_income(request.income),
        };
        tracing::debug!(stage = %Stage::Computed, id = request.id, tax);

        self.bus
            .publish(TAX_RESPONSE_TOPIC, serde_json::to_value(&response)?)?;
        tracing::debug!(stage = %Stage::Published, id = request.id);
        Ok(Some(response))
    }
}

impl Handler for TaxRequestWorker {
    fn name(&self) -> &'static str {
        "tax-request"
    }

    fn handle(&self, message: Message) -> Result<()> {
        match message {
            Message::TaxRequest(request) => self.process(request).map(|_| ()),
            other => {
                tracing::warn!(kind = other.kind(), "unexpected message on {TAX_REQUEST_TOPIC}");
                Ok(())
            }
        }
    }
}

/// Drives one subscription until the bus closes and its queue is drained.
pub async fn consume(mut sub: Subscription, handler: Arc<dyn Handler>) {
    tracing::debug!(topic = %sub.topic, group = %sub.group, worker = handler.name(), "consumer started");
    while let Some(payload) = sub.recv().await {
        let decoded = match messages::decode(payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(topic = %sub.topic, error = %e, "dropping payload");
                continue;
            }
        };
        for message in decoded {
            match message {
                Ok(message) => {
                    let worker = handler.name();
                    let handler = handler.clone();
                    match tokio::task::spawn_blocking(move || handler.handle(message)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => tracing::error!(worker, error = %e, "message handling failed"),
                        Err(e) => tracing::error!(worker, error = %e, "handler task failed"),
                    }
                }
                Err(e) => tracing::warn!(topic = %sub.topic, error = %e, "dropping message"),
            }
        }
    }
    tracing::debug!(topic = %sub.topic, group = %sub.group, "consumer stopped");
}

/// The spawned consumer tasks, one per (topic, group).
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Subscribes every consumer group and spawns its task. Must be called
    /// from inside a tokio runtime.
    pub fn start(
        bus: &Arc<MemoryBus>,
        store: Arc<dyn TransactionStore>,
        correlator: Arc<Correlator>,
    ) -> Result<Self> {
        let mut pool = Self { handles: Vec::new() };
        pool.spawn(
            bus.subscribe(TAX_CALCULATION_TOPIC, TAX_CALCULATION_GROUP)?,
            Arc::new(TransactionTaxWorker::new(store)),
        );
        pool.spawn(
            bus.subscribe(TAX_REQUEST_TOPIC, TAX_PROCESSOR_GROUP)?,
            Arc::new(TaxRequestWorker::new(bus.clone())),
        );
        pool.spawn(bus.subscribe(TAX_RESPONSE_TOPIC, TAX_API_GROUP)?, correlator);
        tracing::info!(workers = pool.handles.len(), "worker pool started");
        Ok(pool)
    }

    fn spawn(&mut self, sub: Subscription, handler: Arc<dyn Handler>) {
        self.handles.push(tokio::spawn(consume(sub, handler)));
    }

    /// Waits for every consumer to finish. Only returns once the bus is closed.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "worker task failed");
            }
        }
    }
}
