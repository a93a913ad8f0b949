use crate::db::Store;
use crate::error::Result;
use crate::fmt::format_bytes;
use crate::settings::load_settings;

pub fn run() -> Result<()> {
    let settings = load_settings();
    let db_path = settings.db_path();

    println!("Data dir:      {}", settings.data_dir);
    println!("Database:      {}", db_path.display());

    if db_path.exists() {
        let size = std::fs::metadata(&db_path)?.len();
        println!("DB size:       {}", format_bytes(size));

        let store = Store::open(&db_path)?;
        println!();
        println!("Transactions:  {}", store.transaction_count()?);
        println!("Taxed:         {}", store.taxed_transaction_count()?);
        println!("Tax records:   {}", store.tax_record_count()?);
    } else {
        println!();
        println!("Database not found. Run `tally init` to set up.");
    }

    Ok(())
}
