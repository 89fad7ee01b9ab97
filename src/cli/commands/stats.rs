//! Store statistics command

use crate::cli::commands::{StoreArgs, load_config, open_broker, runtime};
use crate::cli::error::CliError;
use crate::star::table_counts;

/// Print row counts for every warehouse table
pub fn handle_stats(store: &StoreArgs) -> Result<(), CliError> {
    let config = load_config(store)?;
    let path = config.store_path();
    if !path.exists() {
        return Err(CliError::StoreError(format!(
            "Store not found: {}. Run 'awh run full' first.",
            path.display()
        )));
    }

    let broker = open_broker(&config, true)?;
    let rt = runtime()?;
    let counts = rt.block_on(async {
        let reader = broker.acquire_reader().await?;
        Ok::<_, CliError>(table_counts(&reader)?)
    })?;

    println!("Store: {}", path.display());
    if let Ok(metadata) = std::fs::metadata(&path) {
        println!("Size:  {:.1} MB", metadata.len() as f64 / (1024.0 * 1024.0));
    }
    println!();
    for count in counts {
        match count.rows {
            Some(rows) => println!("  {:<26} {:>12}", count.table, rows),
            None => println!("  {:<26} {:>12}", count.table, "not found"),
        }
    }
    Ok(())
}
