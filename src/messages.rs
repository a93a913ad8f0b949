// Wire messages exchanged over the bus, and the single decoder that turns an
// untyped payload into them.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{Result, TallyError};
use crate::models::TaxRecord;

pub const TAX_CALCULATION_TOPIC: &str = "tax_calculation";
pub const TAX_REQUEST_TOPIC: &str = "tax_request";
pub const TAX_RESPONSE_TOPIC: &str = "tax_response";

/// Fire-and-forget request: compute and store tax on a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionTaxRequest {
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub amount: Option<f64>,
}

/// Correlated request: compute tax for a stored tax record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxRequest {
    pub id: i64,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_income")]
    pub income: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxResponse {
    pub id: i64,
    pub user_name: String,
    pub income: f64,
    pub tax: f64,
    pub net_income: f64,
}

impl From<TaxResponse> for TaxRecord {
    fn from(r: TaxResponse) -> Self {
        TaxRecord {
            id: Some(r.id),
            user_name: r.user_name,
            income: r.income,
            tax_amount: r.tax,
            net_income: r.net_income,
        }
    }
}

/// Every message kind the workers and the correlator understand. Variants are
/// tried in order, so the response (a superset of the request) comes first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    TaxResponse(TaxResponse),
    TaxRequest(TaxRequest),
    TransactionTax(TransactionTaxRequest),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::TaxResponse(_) => "tax_response",
            Message::TaxRequest(_) => "tax_request",
            Message::TransactionTax(_) => "transaction_tax",
        }
    }
}

/// Decodes a map-shaped payload into one message, or a list-shaped payload
/// into one message per element. Elements fail independently; any other
/// payload shape fails as a whole.
pub fn decode(payload: Value) -> Result<Vec<Result<Message>>> {
    match payload {
        Value::Object(_) => Ok(vec![decode_one(payload)]),
        Value::Array(items) => Ok(items.into_iter().map(decode_one).collect()),
        other => Err(TallyError::Decode(format!(
            "unrecognised payload shape: {}",
            shape(&other)
        ))),
    }
}

fn decode_one(item: Value) -> Result<Message> {
    if !item.is_object() {
        return Err(TallyError::Decode(format!(
            "unexpected list element: {}",
            shape(&item)
        )));
    }
    serde_json::from_value(item).map_err(|e| TallyError::Decode(e.to_string()))
}

fn shape(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

/// Accepts a number or a numeric string; anything else counts as zero income.
fn lenient_income<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let parsed = match &value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    Ok(parsed.unwrap_or_else(|| {
        tracing::warn!(income = %value, "failed to parse income, using 0");
        0.0
    }))
}
