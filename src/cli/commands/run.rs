//! Pipeline run command

use std::sync::Arc;

use crate::cli::commands::{StoreArgs, load_config, open_broker, runtime};
use crate::cli::error::CliError;
use crate::pipeline::{LoadMode, MaterializationPipeline, PipelineOptions, RunReport};

/// Run command arguments
#[derive(Debug, Clone)]
pub struct RunArgs {
    pub mode: LoadMode,
    pub store: StoreArgs,
    /// Print the run report as JSON
    pub json: bool,
}

/// Execute one pipeline run
pub fn handle_run(args: &RunArgs) -> Result<(), CliError> {
    let config = load_config(&args.store)?;
    let broker = Arc::new(open_broker(&config, false)?);
    let mut pipeline =
        MaterializationPipeline::new(Arc::clone(&broker), PipelineOptions::from_config(&config));

    let rt = runtime()?;
    let report = rt.block_on(pipeline.run(args.mode))?;

    if args.json {
        let json = serde_json::to_string_pretty(&report)
            .map_err(|e| CliError::IoError(format!("Failed to serialize report: {}", e)))?;
        println!("{}", json);
    } else {
        print_summary(&report);
    }
    Ok(())
}

fn print_summary(report: &RunReport) {
    println!("Run {} ({})", report.run_id, report.mode);
    if report.skipped {
        println!(
            "  No new or modified files; {} unchanged, store left untouched",
            report.unchanged_files.len()
        );
    } else {
        println!(
            "  Loaded {} rows from {} of {} changed file(s)",
            report.rows_loaded,
            report.files_loaded.len(),
            report.changed_files.len()
        );
    }

    for failed in &report.failed_files {
        println!("  Skipped {}: {}", failed.name, failed.reason);
    }

    if let Some(stats) = &report.rebuild {
        println!("  dim_student:              {}", stats.student_count);
        println!("  dim_school:               {}", stats.school_count);
        println!("  dim_descriptor:           {}", stats.descriptor_count);
        println!("  fact_response_summary:    {}", stats.fact_rows);
        println!("  fact_reading_proficiency: {}", stats.reading_fact_rows);
    }
    println!("  Finished in {} ms", report.duration_ms);
}
