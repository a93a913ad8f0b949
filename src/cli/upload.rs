use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use crate::cli::runtime;
use crate::db::Store;
use crate::error::Result;
use crate::service::{TaxService, UploadAck};
use crate::settings::{load_settings, Settings};

pub fn run(file: &str) -> Result<()> {
    let settings = load_settings();
    let reader = BufReader::new(File::open(file)?);
    let store = Arc::new(Store::open(&settings.db_path())?);

    let ack = runtime()?.block_on(upload(store.clone(), &settings, reader))?;

    println!("{}", format_ack(&ack));
    println!(
        "{} of {} stored transactions have tax computed",
        store.taxed_transaction_count()?,
        store.transaction_count()?
    );
    Ok(())
}

async fn upload(store: Arc<Store>, settings: &Settings, reader: BufReader<File>) -> Result<UploadAck> {
    let service = TaxService::start(store, settings)?;
    let ack = service.upload_transactions(reader);
    // Let the workers finish computing tax on whatever was queued.
    service.shutdown().await;
    ack
}

pub fn format_ack(ack: &UploadAck) -> String {
    let mut out = format!(
        "{} rows parsed, {} skipped\n{} records saved in {} batches",
        ack.ingest.rows_parsed, ack.ingest.rows_skipped, ack.ingest.persisted, ack.ingest.batches
    );
    out.push_str(&format!(
        "\n{} tax requests published ({} failed)",
        ack.publish.published, ack.publish.failed
    ));
    out
}
