use std::io::{Read, Seek};

use crate::error::Result;
use crate::models::TransactionRecord;
use crate::parser::TabularParser;
use crate::store::TransactionStore;

pub const DEFAULT_BATCH_SIZE: usize = 30;

/// Buffers records and bulk-inserts them once `batch_size` accumulate.
pub struct BatchWriter<'s> {
    store: &'s dyn TransactionStore,
    buffer: Vec<TransactionRecord>,
    batch_size: usize,
    batches: usize,
    persisted: usize,
}

impl<'s> BatchWriter<'s> {
    pub fn new(store: &'s dyn TransactionStore, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            store,
            buffer: Vec::with_capacity(batch_size),
            batch_size,
            batches: 0,
            persisted: 0,
        }
    }

    pub fn push(&mut self, record: TransactionRecord) -> Result<()> {
        self.buffer.push(record);
        if self.buffer.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Writes the buffer as one batch. On failure the buffer is kept and the
    /// error returned; nothing is retried.
    pub fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.store.save_batch(&self.buffer) {
            tracing::error!(size = self.pending(), error = %e, "failed to save batch");
            return Err(e);
        }
        let size = self.pending();
        tracing::info!("Saved batch of {size} records");
        self.batches += 1;
        self.persisted += size;
        self.buffer.clear();
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    pub fn persisted(&self) -> usize {
        self.persisted
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub rows_parsed: usize,
    pub rows_skipped: usize,
    pub batches: usize,
    pub persisted: usize,
}

/// Parses `reader` row by row and persists the records in batches. A batch
/// failure aborts the whole ingestion.
pub fn ingest<R: Read + Seek>(
    parser: &TabularParser,
    reader: R,
    store: &dyn TransactionStore,
    batch_size: usize,
) -> Result<IngestReport> {
    let mut writer = BatchWriter::new(store, batch_size);
    let summary = parser.parse(reader, |record| writer.push(record))?;
    writer.flush()?;
    let report = IngestReport {
        rows_parsed: summary.rows_parsed,
        rows_skipped: summary.rows_skipped,
        batches: writer.batches(),
        persisted: writer.persisted(),
    };
    tracing::info!(?report, "ingestion complete");
    Ok(report)
}
