use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::tax;

/// One ingested spreadsheet row. Every field is optional because blank cells
/// stay blank; `tax_amount` is filled in later by the transaction worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: Option<i64>,
    pub txn_date: Option<DateTime<Utc>>,
    pub transaction_id: Option<String>,
    pub account_number: Option<String>,
    pub customer_name: Option<String>,
    pub merchant_name: Option<String>,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub payment_method: Option<String>,
    pub status: Option<String>,
    pub category: Option<String>,
    pub sub_category: Option<String>,
    pub country: Option<String>,
    pub city: Option<String>,
    pub channel: Option<String>,
    pub reward_points: Option<i64>,
    pub settlement_date: Option<NaiveDate>,
    pub remarks: Option<String>,
    pub tax_amount: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxRecord {
    pub id: Option<i64>,
    pub user_name: String,
    pub income: f64,
    pub tax_amount: f64,
    pub net_income: f64,
}

impl TaxRecord {
    /// Builds an unsaved record with tax and net income computed from `income`.
    pub fn assess(user_name: &str, income: f64) -> Self {
        let tax_amount = tax::tax(income);
        Self {
            id: None,
            user_name: user_name.to_string(),
            income,
            tax_amount,
            net_income: income - tax_amount,
        }
    }
}

/// One slice of an ordered scan.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub number: usize,
    pub is_last: bool,
}
