use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use comfy_table::{Cell, Table};

use crate::cli::runtime;
use crate::db::Store;
use crate::error::Result;
use crate::fmt::amount;
use crate::models::TaxRecord;
use crate::service::TaxService;
use crate::settings::{load_settings, Settings};

fn open_store(settings: &Settings) -> Result<Arc<Store>> {
    Ok(Arc::new(Store::open(&settings.db_path())?))
}

pub fn calculate(user: &str, income: f64) -> Result<()> {
    let settings = load_settings();
    let store = open_store(&settings)?;
    let record = runtime()?.block_on(calculate_on(store, &settings, user, income))?;
    println!("{}", format_records("Tax calculated", &[record]));
    Ok(())
}

pub fn get(user: &str) -> Result<()> {
    let settings = load_settings();
    let store = open_store(&settings)?;
    let found = runtime()?.block_on(get_on(store, &settings, user))?;
    match found {
        Some(record) => println!("{}", format_records("Tax record", &[record])),
        None => println!("No tax record for {user}"),
    }
    Ok(())
}

async fn calculate_on(store: Arc<Store>, settings: &Settings, user: &str, income: f64) -> Result<TaxRecord> {
    let service = TaxService::start(store, settings)?;
    let record = service.calculate_tax(user, income);
    service.shutdown().await;
    record
}

async fn get_on(store: Arc<Store>, settings: &Settings, user: &str) -> Result<Option<TaxRecord>> {
    let service = TaxService::start(store, settings)?;
    let found = service.get_tax_record(user);
    service.shutdown().await;
    found
}

pub fn list(timeout_secs: Option<u64>) -> Result<()> {
    let settings = load_settings();
    let store = open_store(&settings)?;
    let stored = store.tax_record_count()?;
    let records = runtime()?.block_on(list_on(store, &settings, timeout_secs.map(Duration::from_secs)))?;

    if records.is_empty() && stored == 0 {
        println!("No tax records yet. Run `tally calculate USER INCOME` first.");
        return Ok(());
    }
    println!("{}", format_records("Tax records", &records));
    let missing = (stored as usize).saturating_sub(records.len());
    if missing > 0 {
        println!("{}", format!("{missing} record(s) timed out").yellow());
    }
    Ok(())
}

async fn list_on(
    store: Arc<Store>,
    settings: &Settings,
    timeout: Option<Duration>,
) -> Result<Vec<TaxRecord>> {
    let service = TaxService::start(store, settings)?;
    let mut records = match timeout {
        Some(timeout) => service.list_tax_records_within(timeout).await,
        None => service.list_tax_records().await,
    };
    service.shutdown().await;
    if let Ok(records) = records.as_mut() {
        records.sort_by(|a, b| a.user_name.to_lowercase().cmp(&b.user_name.to_lowercase()));
    }
    records
}

pub fn format_records(title: &str, records: &[TaxRecord]) -> String {
    let mut table = Table::new();
    table.set_header(vec!["ID", "User", "Income", "Tax", "Net Income"]);
    for r in records {
        table.add_row(vec![
            Cell::new(r.id.map(|id| id.to_string()).unwrap_or_default()),
            Cell::new(&r.user_name),
            Cell::new(amount(r.income)),
            Cell::new(amount(r.tax_amount)),
            Cell::new(amount(r.net_income)),
        ]);
    }
    if records.len() > 1 {
        let total_tax: f64 = records.iter().map(|r| r.tax_amount).sum();
        table.add_row(vec![
            Cell::new(""),
            Cell::new("Total".bold()),
            Cell::new(""),
            Cell::new(amount(total_tax)),
            Cell::new(""),
        ]);
    }
    format!("{}\n{table}", title.bold())
}
