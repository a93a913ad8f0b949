use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension};

use crate::error::{Result, TallyError};
use crate::models::{Page, TaxRecord, TransactionRecord};
use crate::store::{TaxRecordStore, TransactionStore};

pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS transactions (
    id INTEGER PRIMARY KEY,
    txn_date TEXT,
    transaction_id TEXT,
    account_number TEXT,
    customer_name TEXT,
    merchant_name TEXT,
    amount REAL,
    currency TEXT,
    payment_method TEXT,
    status TEXT,
    category TEXT,
    sub_category TEXT,
    country TEXT,
    city TEXT,
    channel TEXT,
    reward_points INTEGER,
    settlement_date TEXT,
    remarks TEXT,
    tax_amount REAL,
    created_at TEXT DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_transactions_txn_date ON transactions(txn_date);
CREATE INDEX IF NOT EXISTS idx_transactions_transaction_id ON transactions(transaction_id);

CREATE TABLE IF NOT EXISTS tax_records (
    id INTEGER PRIMARY KEY,
    user_name TEXT NOT NULL UNIQUE COLLATE NOCASE,
    income REAL NOT NULL,
    tax_amount REAL NOT NULL,
    net_income REAL NOT NULL,
    updated_at TEXT DEFAULT (datetime('now'))
);
";

const TRANSACTION_COLUMNS: &str = "id, txn_date, transaction_id, account_number, customer_name, \
    merchant_name, amount, currency, payment_method, status, category, sub_category, country, \
    city, channel, reward_points, settlement_date, remarks, tax_amount";

pub fn get_connection(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

fn transaction_from_row(row: &rusqlite::Row) -> rusqlite::Result<TransactionRecord> {
    Ok(TransactionRecord {
        id: row.get(0)?,
        txn_date: row.get(1)?,
        transaction_id: row.get(2)?,
        account_number: row.get(3)?,
        customer_name: row.get(4)?,
        merchant_name: row.get(5)?,
        amount: row.get(6)?,
        currency: row.get(7)?,
        payment_method: row.get(8)?,
        status: row.get(9)?,
        category: row.get(10)?,
        sub_category: row.get(11)?,
        country: row.get(12)?,
        city: row.get(13)?,
        channel: row.get(14)?,
        reward_points: row.get(15)?,
        settlement_date: row.get(16)?,
        remarks: row.get(17)?,
        tax_amount: row.get(18)?,
    })
}

fn tax_record_from_row(row: &rusqlite::Row) -> rusqlite::Result<TaxRecord> {
    Ok(TaxRecord {
        id: row.get(0)?,
        user_name: row.get(1)?,
        income: row.get(2)?,
        tax_amount: row.get(3)?,
        net_income: row.get(4)?,
    })
}

/// The SQLite-backed record store. The connection sits behind a mutex so the
/// store can be shared between the ingesting caller and the worker tasks;
/// every method holds the lock only for its own statements.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = get_connection(db_path)?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| TallyError::Other("store connection lock poisoned".to_string()))
    }

    pub fn transaction_count(&self) -> Result<i64> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT count(*) FROM transactions", [], |r| r.get(0))?)
    }

    pub fn taxed_transaction_count(&self) -> Result<i64> {
        let conn = self.conn()?;
        Ok(conn.query_row(
            "SELECT count(*) FROM transactions WHERE tax_amount IS NOT NULL",
            [],
            |r| r.get(0),
        )?)
    }

    pub fn tax_record_count(&self) -> Result<i64> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT count(*) FROM tax_records", [], |r| r.get(0))?)
    }
}

impl TransactionStore for Store {
    fn save_batch(&self, batch: &[TransactionRecord]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO transactions (txn_date, transaction_id, account_number, customer_name, \
                 merchant_name, amount, currency, payment_method, status, category, sub_category, \
                 country, city, channel, reward_points, settlement_date, remarks, tax_amount) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            )?;
            for r in batch {
                stmt.execute(rusqlite::params![
                    r.txn_date,
                    r.transaction_id,
                    r.account_number,
                    r.customer_name,
                    r.merchant_name,
                    r.amount,
                    r.currency,
                    r.payment_method,
                    r.status,
                    r.category,
                    r.sub_category,
                    r.country,
                    r.city,
                    r.channel,
                    r.reward_points,
                    r.settlement_date,
                    r.remarks,
                    r.tax_amount,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn transactions_page(&self, page: usize, size: usize) -> Result<Page<TransactionRecord>> {
        let conn = self.conn()?;
        let total: i64 = conn.query_row("SELECT count(*) FROM transactions", [], |r| r.get(0))?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions ORDER BY txn_date ASC, id ASC LIMIT ?1 OFFSET ?2"
        ))?;
        let items = stmt
            .query_map(
                rusqlite::params![size as i64, (page * size) as i64],
                transaction_from_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Page {
            items,
            number: page,
            is_last: ((page + 1) * size) as i64 >= total,
        })
    }

    fn find_transaction(&self, transaction_id: &str) -> Result<Option<TransactionRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE transaction_id = ?1 ORDER BY id LIMIT 1"
        ))?;
        Ok(stmt
            .query_row([transaction_id], transaction_from_row)
            .optional()?)
    }

    fn set_tax_amount(&self, id: i64, tax_amount: f64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE transactions SET tax_amount = ?1 WHERE id = ?2",
            rusqlite::params![tax_amount, id],
        )?;
        Ok(())
    }
}

impl TaxRecordStore for Store {
    fn save_tax_record(&self, record: &TaxRecord) -> Result<TaxRecord> {
        let conn = self.conn()?;
        let id = match record.id {
            Some(id) => {
                let updated = conn.execute(
                    "UPDATE tax_records SET user_name = ?1, income = ?2, tax_amount = ?3, \
                     net_income = ?4, updated_at = datetime('now') WHERE id = ?5",
                    rusqlite::params![
                        record.user_name,
                        record.income,
                        record.tax_amount,
                        record.net_income,
                        id
                    ],
                )?;
                if updated == 0 {
                    conn.execute(
                        "INSERT INTO tax_records (id, user_name, income, tax_amount, net_income) \
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        rusqlite::params![
                            id,
                            record.user_name,
                            record.income,
                            record.tax_amount,
                            record.net_income
                        ],
                    )?;
                }
                id
            }
            None => conn.query_row(
                "INSERT INTO tax_records (user_name, income, tax_amount, net_income) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(user_name) DO UPDATE SET income = excluded.income, \
                 tax_amount = excluded.tax_amount, net_income = excluded.net_income, \
                 updated_at = datetime('now') \
                 RETURNING id",
                rusqlite::params![
                    record.user_name,
                    record.income,
                    record.tax_amount,
                    record.net_income
                ],
                |r| r.get(0),
            )?,
        };
        // An upsert keeps the stored spelling of the name, so hand back the row.
        let saved = conn.query_row(
            "SELECT id, user_name, income, tax_amount, net_income FROM tax_records WHERE id = ?1",
            [id],
            tax_record_from_row,
        )?;
        Ok(saved)
    }

    fn find_tax_record(&self, user_name: &str) -> Result<Option<TaxRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, user_name, income, tax_amount, net_income FROM tax_records \
             WHERE user_name = ?1 COLLATE NOCASE",
        )?;
        Ok(stmt.query_row([user_name], tax_record_from_row).optional()?)
    }

    fn all_tax_records(&self) -> Result<Vec<TaxRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, user_name, income, tax_amount, net_income FROM tax_records ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], tax_record_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
