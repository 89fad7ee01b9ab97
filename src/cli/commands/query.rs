//! SQL query CLI command
//!
//! Runs a read-only query against the warehouse through a reader handle.

use crate::cli::commands::{StoreArgs, load_config, open_broker, runtime};
use crate::cli::error::CliError;
use crate::database::{OutputFormat, format_query_result};

/// Query command arguments
#[derive(Debug, Clone)]
pub struct QueryArgs {
    /// SQL query to execute
    pub sql: String,
    pub store: StoreArgs,
    /// Output format
    pub format: String,
}

/// Execute a SQL query against the warehouse
pub fn handle_query(args: &QueryArgs) -> Result<(), CliError> {
    let output_format: OutputFormat = args
        .format
        .parse()
        .map_err(|e: String| CliError::InvalidArgument(e))?;

    let config = load_config(&args.store)?;
    if !config.store_path().exists() {
        return Err(CliError::StoreError(format!(
            "Store not found: {}",
            config.store_path().display()
        )));
    }

    let broker = open_broker(&config, true)?;
    let rt = runtime()?;
    let result = rt.block_on(async {
        let reader = broker.acquire_reader().await?;
        Ok::<_, CliError>(reader.query(&args.sql)?)
    })?;

    println!("{}", format_query_result(&result, output_format));
    if output_format != OutputFormat::Json {
        eprintln!("\nExecution time: {}ms", result.execution_time_ms);
    }
    Ok(())
}
