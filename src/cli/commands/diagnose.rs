//! Duplicate student diagnostics

use crate::cli::commands::{StoreArgs, load_config, open_broker, runtime};
use crate::cli::error::CliError;
use crate::star::find_conflicting_students;

/// List student identifiers whose raw rows disagree on name or national ID
pub fn handle_diagnose(store: &StoreArgs, limit: usize) -> Result<(), CliError> {
    let config = load_config(store)?;
    if !config.store_path().exists() {
        return Err(CliError::StoreError(format!(
            "Store not found: {}",
            config.store_path().display()
        )));
    }

    let broker = open_broker(&config, true)?;
    let rt = runtime()?;
    let conflicts = rt.block_on(async {
        let reader = broker.acquire_reader().await?;
        Ok::<_, CliError>(find_conflicting_students(&reader, limit)?)
    })?;

    if conflicts.is_empty() {
        println!("No conflicting student identifiers found");
        return Ok(());
    }

    println!("{} conflicting student identifier(s):", conflicts.len());
    for conflict in conflicts {
        println!("  {}", conflict.student_id);
        if conflict.names.len() > 1 {
            println!("    names:        {}", conflict.names.join(" | "));
        }
        if conflict.national_ids.len() > 1 {
            println!("    national ids: {}", conflict.national_ids.join(" | "));
        }
    }
    Ok(())
}
