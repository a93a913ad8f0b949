// Persistence seams. `db::Store` implements both traits on SQLite; tests swap
// in small fakes to inject failures or count lookups.

use crate::error::Result;
use crate::models::{Page, TaxRecord, TransactionRecord};

pub trait TransactionStore: Send + Sync {
    /// Persists every record or none of them.
    fn save_batch(&self, batch: &[TransactionRecord]) -> Result<()>;

    /// Zero-based page of transactions ordered by timestamp ascending.
    fn transactions_page(&self, page: usize, size: usize) -> Result<Page<TransactionRecord>>;

    fn find_transaction(&self, transaction_id: &str) -> Result<Option<TransactionRecord>>;

    fn set_tax_amount(&self, id: i64, tax_amount: f64) -> Result<()>;
}

pub trait TaxRecordStore: Send + Sync {
    /// Inserts or updates `record`, returning it with its persisted id.
    fn save_tax_record(&self, record: &TaxRecord) -> Result<TaxRecord>;

    /// Case-insensitive lookup by user name.
    fn find_tax_record(&self, user_name: &str) -> Result<Option<TaxRecord>>;

    fn all_tax_records(&self) -> Result<Vec<TaxRecord>>;
}
