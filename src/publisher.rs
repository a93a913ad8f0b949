use crate::bus::MessageBus;
use crate::error::{Result, TallyError};
use crate::messages::{TransactionTaxRequest, TAX_CALCULATION_TOPIC};
use crate::store::TransactionStore;

pub const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub published: usize,
    pub failed: usize,
    pub pages: usize,
}

/// Walks the stored transactions oldest first and emits one fire-and-forget
/// tax request per record. Individual publish failures are logged and
/// skipped; a failing page query aborts the scan.
pub fn publish_transactions(
    store: &dyn TransactionStore,
    bus: &dyn MessageBus,
    page_size: usize,
) -> Result<PublishReport> {
    let page_size = page_size.max(1);
    let mut report = PublishReport::default();
    let mut page = 0;

    tracing::info!("publishing stored transactions for tax calculation");
    loop {
        let batch = store.transactions_page(page, page_size)?;
        if batch.items.is_empty() {
            break;
        }
        report.pages += 1;
        tracing::debug!(page = batch.number, size = batch.items.len(), "publishing page");
        let short = batch.items.len() < page_size;

        for txn in batch.items {
            let request = TransactionTaxRequest {
                transaction_id: txn.transaction_id,
                amount: txn.amount,
            };
            let outcome = serde_json::to_value(&request)
                .map_err(TallyError::from)
                .and_then(|payload| bus.publish(TAX_CALCULATION_TOPIC, payload));
            match outcome {
                Ok(()) => report.published += 1,
                Err(e) => {
                    tracing::error!(
                        id = ?txn.id,
                        transaction_id = ?request.transaction_id,
                        error = %e,
                        "failed to publish transaction"
                    );
                    report.failed += 1;
                }
            }
        }

        if short || batch.is_last {
            break;
        }
        page += 1;
    }
    tracing::info!(?report, "finished publishing transactions");
    Ok(report)
}
