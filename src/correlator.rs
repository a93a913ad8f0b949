// Request/response correlation over the bus.
//
// A caller registers a completion slot under the record id, publishes the
// request and waits with a deadline. The response listener removes the slot
// and completes it in one step, so a duplicate or late response finds nothing
// and is dropped.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::bus::MessageBus;
use crate::cache::CachedTaxRecords;
use crate::error::{Result, TallyError};
use crate::messages::{Message, TaxRequest, TaxResponse, TAX_REQUEST_TOPIC, TAX_RESPONSE_TOPIC};
use crate::models::TaxRecord;
use crate::worker::Handler;

pub struct Correlator {
    pending: DashMap<i64, oneshot::Sender<TaxRecord>>,
    bus: Arc<dyn MessageBus>,
    records: Arc<CachedTaxRecords>,
}

impl Correlator {
    pub fn new(bus: Arc<dyn MessageBus>, records: Arc<CachedTaxRecords>) -> Self {
        Self {
            pending: DashMap::new(),
            bus,
            records,
        }
    }

    /// Publishes a tax request for `record` and waits up to `timeout` for its
    /// response. `Ok(None)` means the deadline passed or the correlator was
    /// closed first.
    pub async fn submit_and_wait(
        &self,
        record: &TaxRecord,
        timeout: Duration,
    ) -> Result<Option<TaxRecord>> {
        let id = record
            .id
            .ok_or_else(|| TallyError::Other("cannot correlate an unsaved tax record".to_string()))?;
        let payload = serde_json::to_value(TaxRequest {
            id,
            user_name: Some(record.user_name.clone()),
            income: record.income,
        })?;

        let rx = self.register(id)?;
        if let Err(e) = self.bus.publish(TAX_REQUEST_TOPIC, payload) {
            self.pending.remove(&id);
            return Err(e);
        }
        tracing::debug!(id, user = %record.user_name, "tax request published");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(completed)) => Ok(Some(completed)),
            Ok(Err(_)) => {
                tracing::debug!(id, "pending request dropped before completion");
                Ok(None)
            }
            Err(_) => {
                // Only drop our own slot; a newer caller may have re-registered.
                self.pending.remove_if(&id, |_, tx| tx.is_closed());
                tracing::warn!(id, ?timeout, "timed out waiting for tax response");
                Ok(None)
            }
        }
    }

    fn register(&self, id: i64) -> Result<oneshot::Receiver<TaxRecord>> {
        let (tx, rx) = oneshot::channel();
        match self.pending.entry(id) {
            Entry::Occupied(mut slot) => {
                if !slot.get().is_closed() {
                    return Err(TallyError::AlreadyPending(id));
                }
                slot.insert(tx);
            }
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }
        Ok(rx)
    }

    /// Resolves the waiter for `response.id`, then persists and caches the
    /// record. Returns `false` when no one was waiting.
    pub fn complete(&self, response: TaxResponse) -> Result<bool> {
        let id = response.id;
        let Some((_, tx)) = self.pending.remove(&id) else {
            tracing::warn!(id, "no pending request for response, dropping");
            return Ok(false);
        };
        let record = TaxRecord::from(response);
        if tx.send(record.clone()).is_err() {
            tracing::warn!(id, "waiter gave up before the response arrived, dropping");
            return Ok(false);
        }
        let saved = self.records.put(&record)?;
        tracing::info!(id, user = %saved.user_name, tax = saved.tax_amount, "tax response completed");
        Ok(true)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drops every outstanding slot; their waiters resolve to `None`.
    pub fn close(&self) {
        let dropped = self.pending.len();
        self.pending.clear();
        if dropped > 0 {
            tracing::info!(dropped, "discarded pending tax requests");
        }
    }
}

impl Handler for Correlator {
    fn name(&self) -> &'static str {
        "correlator"
    }

    fn handle(&self, message: Message) -> Result<()> {
        match message {
            Message::TaxResponse(response) => self.complete(response).map(|_| ()),
            other => {
                tracing::warn!(kind = other.kind(), "unrecognised payload on {TAX_RESPONSE_TOPIC}");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MemoryBus, Subscription};
    use crate::cache::Cache;
    use crate::db::tests::test_store;
    use crate::db::Store;
    use crate::messages;
    use crate::store::TaxRecordStore;
    use crate::tax;

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<Store>,
        bus: Arc<MemoryBus>,
        correlator: Arc<Correlator>,
    }

    fn harness() -> Harness {
        let (dir, store) = test_store();
        let store = Arc::new(store);
        let bus = Arc::new(MemoryBus::new());
        let records = Arc::new(CachedTaxRecords::new(store.clone(), Arc::new(Cache::new())));
        let correlator = Arc::new(Correlator::new(bus.clone(), records));
        Harness { _dir: dir, store, bus, correlator }
    }

    fn saved(h: &Harness, user: &str, income: f64) -> TaxRecord {
        h.store.save_tax_record(&TaxRecord::assess(user, income)).unwrap()
    }

    fn respond_to(request: &serde_json::Value) -> TaxResponse {
        let Ok(mut decoded) = messages::decode(request.clone()) else { panic!("bad request") };
        match decoded.remove(0).unwrap() {
            Message::TaxRequest(r) => TaxResponse {
                id: r.id,
                user_name: r.user_name.unwrap(),
                income: r.income,
                tax: tax::tax(r.income),
                net_income: tax::net_income(r.income),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    async fn next_request(sub: &mut Subscription) -> serde_json::Value {
        sub.recv().await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_out_of_order_responses_reach_their_own_callers() {
        let h = harness();
        let mut requests = h.bus.subscribe(TAX_REQUEST_TOPIC, "test").unwrap();
        let alice = saved(&h, "alice", 600_000.0);
        let bob = saved(&h, "bob", 1_500_000.0);

        let c = h.correlator.clone();
        let a = alice.clone();
        let first = tokio::spawn(async move { c.submit_and_wait(&a, Duration::from_secs(5)).await });
        let r1 = next_request(&mut requests).await;
        let c = h.correlator.clone();
        let b = bob.clone();
        let second = tokio::spawn(async move { c.submit_and_wait(&b, Duration::from_secs(5)).await });
        let r2 = next_request(&mut requests).await;

        assert!(h.correlator.complete(respond_to(&r2)).unwrap());
        assert!(h.correlator.complete(respond_to(&r1)).unwrap());

        let got_alice = first.await.unwrap().unwrap().unwrap();
        let got_bob = second.await.unwrap().unwrap().unwrap();
        assert_eq!(got_alice.user_name, "alice");
        assert_eq!(got_alice.tax_amount, 32_500.0);
        assert_eq!(got_bob.user_name, "bob");
        assert_eq!(got_bob.tax_amount, 262_500.0);
        assert_eq!(h.correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_then_late_response_is_dropped() {
        let h = harness();
        let mut requests = h.bus.subscribe(TAX_REQUEST_TOPIC, "test").unwrap();
        let slow = saved(&h, "slow", 400_000.0);

        let result = h
            .correlator
            .submit_and_wait(&slow, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(h.correlator.pending_count(), 0);

        let late = respond_to(&next_request(&mut requests).await);
        assert!(!h.correlator.complete(late).unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_late_response_does_not_disturb_other_entries() {
        let h = harness();
        let mut requests = h.bus.subscribe(TAX_REQUEST_TOPIC, "test").unwrap();
        let slow = saved(&h, "slow", 400_000.0);
        let fast = saved(&h, "fast", 800_000.0);

        assert!(h
            .correlator
            .submit_and_wait(&slow, Duration::from_millis(10))
            .await
            .unwrap()
            .is_none());
        let slow_request = next_request(&mut requests).await;

        let c = h.correlator.clone();
        let waiting = tokio::spawn(async move { c.submit_and_wait(&fast, Duration::from_secs(5)).await });
        let fast_request = next_request(&mut requests).await;

        assert!(!h.correlator.complete(respond_to(&slow_request)).unwrap());
        assert_eq!(h.correlator.pending_count(), 1);
        assert!(h.correlator.complete(respond_to(&fast_request)).unwrap());
        let got = waiting.await.unwrap().unwrap().unwrap();
        assert_eq!(got.user_name, "fast");
        assert_eq!(got.tax_amount, tax::tax(800_000.0));
    }

    #[tokio::test]
    async fn test_duplicate_pending_id_is_rejected() {
        let h = harness();
        let _rx = h.correlator.register(5).unwrap();
        assert!(matches!(h.correlator.register(5), Err(TallyError::AlreadyPending(5))));
    }

    #[tokio::test]
    async fn test_abandoned_slot_can_be_reused() {
        let h = harness();
        drop(h.correlator.register(5).unwrap());
        assert!(h.correlator.register(5).is_ok());
    }

    #[tokio::test]
    async fn test_second_response_is_a_no_op() {
        let h = harness();
        let record = saved(&h, "dup", 300_000.0);
        let rx = h.correlator.register(record.id.unwrap()).unwrap();
        let response = TaxResponse {
            id: record.id.unwrap(),
            user_name: "dup".to_string(),
            income: 300_000.0,
            tax: 2_500.0,
            net_income: 297_500.0,
        };
        assert!(h.correlator.complete(response.clone()).unwrap());
        assert!(!h.correlator.complete(response).unwrap());
        assert_eq!(rx.await.unwrap().tax_amount, 2_500.0);
    }

    #[tokio::test]
    async fn test_completion_persists_and_caches() {
        let h = harness();
        let record = saved(&h, "carol", 100.0);
        let _rx = h.correlator.register(record.id.unwrap()).unwrap();
        h.correlator
            .complete(TaxResponse {
                id: record.id.unwrap(),
                user_name: "carol".to_string(),
                income: 2_000_000.0,
                tax: 412_500.0,
                net_income: 1_587_500.0,
            })
            .unwrap();
        let stored = h.store.find_tax_record("carol").unwrap().unwrap();
        assert_eq!(stored.income, 2_000_000.0);
        assert_eq!(stored.id, record.id);
    }

    #[tokio::test]
    async fn test_close_resolves_waiters_to_none() {
        let h = harness();
        let mut requests = h.bus.subscribe(TAX_REQUEST_TOPIC, "test").unwrap();
        let record = saved(&h, "dave", 10.0);
        let c = h.correlator.clone();
        let waiting = tokio::spawn(async move { c.submit_and_wait(&record, Duration::from_secs(30)).await });
        next_request(&mut requests).await;
        h.correlator.close();
        assert!(waiting.await.unwrap().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_publish_failure_clears_slot() {
        let h = harness();
        let record = saved(&h, "erin", 10.0);
        h.bus.close();
        assert!(h
            .correlator
            .submit_and_wait(&record, Duration::from_secs(1))
            .await
            .is_err());
        assert_eq!(h.correlator.pending_count(), 0);
    }
}
