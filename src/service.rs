use std::io::{Read, Seek};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use crate::bus::MemoryBus;
use crate::cache::{Cache, CachedTaxRecords};
use crate::correlator::Correlator;
use crate::db::Store;
use crate::error::{Result, TallyError};
use crate::ingest::{self, IngestReport};
use crate::models::TaxRecord;
use crate::parser::TabularParser;
use crate::publisher::{self, PublishReport};
use crate::settings::Settings;
use crate::worker::WorkerPool;

/// What an upload did: the ingestion summary and the publish summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadAck {
    pub ingest: IngestReport,
    pub publish: PublishReport,
}

/// Owns the store, cache, bus, correlator and consumer tasks for one run.
pub struct TaxService {
    store: Arc<Store>,
    bus: Arc<MemoryBus>,
    records: Arc<CachedTaxRecords>,
    correlator: Arc<Correlator>,
    workers: WorkerPool,
    parser: TabularParser,
    batch_size: usize,
    page_size: usize,
    response_timeout: Duration,
}

impl TaxService {
    /// Wires everything up and starts the consumers. Must be called from
    /// inside a tokio runtime.
    pub fn start(store: Arc<Store>, settings: &Settings) -> Result<Self> {
        let bus = Arc::new(MemoryBus::new());
        let cache = Arc::new(Cache::new());
        let records = Arc::new(CachedTaxRecords::new(store.clone(), cache));
        let correlator = Arc::new(Correlator::new(bus.clone(), records.clone()));
        let workers = WorkerPool::start(&bus, store.clone(), correlator.clone())?;
        Ok(Self {
            store,
            bus,
            records,
            correlator,
            workers,
            parser: TabularParser::default(),
            batch_size: settings.batch_size,
            page_size: settings.page_size,
            response_timeout: settings.response_timeout(),
        })
    }

    pub fn calculate_tax(&self, user_name: &str, income: f64) -> Result<TaxRecord> {
        let user_name = user_name.trim();
        if user_name.is_empty() {
            return Err(TallyError::blank_user_name());
        }
        let saved = self.records.put(&TaxRecord::assess(user_name, income))?;
        tracing::info!(user = %saved.user_name, income, tax = saved.tax_amount, "tax calculated");
        Ok(saved)
    }

    pub fn get_tax_record(&self, user_name: &str) -> Result<Option<TaxRecord>> {
        self.records.get(user_name.trim())
    }

    /// Re-computes every stored record through the bus, using the configured
    /// response timeout.
    pub async fn list_tax_records(&self) -> Result<Vec<TaxRecord>> {
        self.list_tax_records_within(self.response_timeout).await
    }

    /// One correlated round trip per stored record, all in flight at once.
    /// Records whose response misses `timeout` are left out.
    pub async fn list_tax_records_within(&self, timeout: Duration) -> Result<Vec<TaxRecord>> {
        let stored = self.records.all()?;
        let total = stored.len();
        let waits = stored
            .iter()
            .map(|record| self.correlator.submit_and_wait(record, timeout));
        let results = join_all(waits).await;

        let mut completed = Vec::with_capacity(total);
        for (record, result) in stored.iter().zip(results) {
            match result {
                Ok(Some(done)) => completed.push(done),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(user = %record.user_name, error = %e, "tax request failed")
                }
            }
        }
        tracing::info!(
            total,
            completed = completed.len(),
            pending = self.correlator.pending_count(),
            "tax records listed"
        );
        Ok(completed)
    }

    /// Ingests a spreadsheet synchronously, then queues one tax request per
    /// stored transaction.
    pub fn upload_transactions<R: Read + Seek>(&self, reader: R) -> Result<UploadAck> {
        let ingest = ingest::ingest(&self.parser, reader, self.store.as_ref(), self.batch_size)?;
        let publish =
            publisher::publish_transactions(self.store.as_ref(), self.bus.as_ref(), self.page_size)?;
        Ok(UploadAck { ingest, publish })
    }

    /// Closes the bus, lets every consumer drain its queue, then drops any
    /// request still waiting for a response.
    pub async fn shutdown(self) {
        self.bus.close();
        self.workers.join().await;
        self.correlator.close();
        tracing::debug!("tax service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TaxRecordStore;
    use std::io::Cursor;

    fn service() -> (tempfile::TempDir, TaxService) {
        let (dir, store) = crate::db::tests::test_store();
        let service = TaxService::start(Arc::new(store), &Settings::default()).unwrap();
        (dir, service)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_calculate_then_get() {
        let (_dir, service) = service();
        let saved = service.calculate_tax("alice", 600_000.0).unwrap();
        assert_eq!(saved.tax_amount, 32_500.0);
        assert_eq!(saved.net_income, 567_500.0);
        assert!(saved.id.is_some());

        let got = service.get_tax_record("ALICE").unwrap().unwrap();
        assert_eq!(got.id, saved.id);
        service.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_recalculation_updates_existing_record() {
        let (_dir, service) = service();
        let first = service.calculate_tax("bob", 100.0).unwrap();
        let second = service.calculate_tax("bob", 1_500_000.0).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.tax_amount, 262_500.0);
        assert_eq!(service.store.tax_record_count().unwrap(), 1);
        service.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_recalculation_under_other_case_is_visible() {
        let (_dir, service) = service();
        service.calculate_tax("alice", 100.0).unwrap();
        let second = service.calculate_tax("ALICE", 1_500_000.0).unwrap();
        assert_eq!(second.user_name, "alice");

        let got = service.get_tax_record("alice").unwrap().unwrap();
        assert_eq!(got.income, 1_500_000.0);
        assert_eq!(got.tax_amount, 262_500.0);
        assert_eq!(got.user_name, "alice");
        service.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_blank_user_is_rejected_before_mutation() {
        let (_dir, service) = service();
        let err = service.calculate_tax("   ", 10.0).unwrap_err();
        assert_eq!(err.to_string(), "[1001] User name cannot be empty");
        assert_eq!(service.store.tax_record_count().unwrap(), 0);
        service.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_list_round_trips_every_record() {
        let (_dir, service) = service();
        service.calculate_tax("alice", 600_000.0).unwrap();
        service.calculate_tax("bob", 1_500_000.0).unwrap();
        service.calculate_tax("carol", 200_000.0).unwrap();

        let mut listed = service
            .list_tax_records_within(Duration::from_secs(5))
            .await
            .unwrap();
        listed.sort_by(|a, b| a.user_name.cmp(&b.user_name));
        let taxes: Vec<f64> = listed.iter().map(|r| r.tax_amount).collect();
        assert_eq!(taxes, vec![32_500.0, 262_500.0, 0.0]);
        service.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_list_on_empty_store() {
        let (_dir, service) = service();
        assert!(service.list_tax_records().await.unwrap().is_empty());
        service.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_upload_computes_tax_on_every_transaction() {
        let (_dir, service) = service();
        let mut csv = String::from("txn_date,transaction_id,account,customer,merchant,amount\n");
        for i in 0..40 {
            csv.push_str(&format!("2025-01-01T10:00:{:02}.000,T-{i},A,C,M,{}\n", i % 60, 300_000 + i));
        }
        csv.push_str("not-a-date,T-BAD,A,C,M,1\n");

        let ack = service.upload_transactions(Cursor::new(csv.into_bytes())).unwrap();
        assert_eq!(ack.ingest.persisted, 40);
        assert_eq!(ack.ingest.rows_skipped, 1);
        assert_eq!(ack.ingest.batches, 2);
        assert_eq!(ack.publish.published, 40);

        let store = service.store.clone();
        service.shutdown().await;
        assert_eq!(store.taxed_transaction_count().unwrap(), 40);
        let t = crate::store::TransactionStore::find_transaction(store.as_ref(), "T-0")
            .unwrap()
            .unwrap();
        assert_eq!(t.tax_amount, Some(2_500.0));
        assert_eq!(store.all_tax_records().unwrap().len(), 0);
    }
}
