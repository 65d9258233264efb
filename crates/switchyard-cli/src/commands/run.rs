//! `switchyard run`: submit one query and wait for its result.

use std::time::Duration;

use switchyard_core::master::global::{QueryResponse, ResultStatus};
use switchyard_core::SwitchyardConfig;

use super::{await_finalized, parse_context, print_json, start_pipeline};

const FINALIZE_GRACE: Duration = Duration::from_secs(1);

pub struct RunOptions<'a> {
    pub query: &'a str,
    pub context: Option<&'a str>,
    pub timeout: Duration,
    pub slave_delay: Duration,
}

/// Start the pipeline, process one query, and shut down again.
pub async fn execute(config: SwitchyardConfig, options: &RunOptions<'_>) -> Result<QueryResponse, String> {
    let context = parse_context(options.context)?;
    let system = start_pipeline(config, options.slave_delay).await?;
    let global = system.global();
    let outcome = match global.process_query(options.query, context, options.timeout).await {
        Ok(mut response) => {
            if !response.cached {
                response.result = await_finalized(global, &response.result.request_id, FINALIZE_GRACE).await;
            }
            Ok(response)
        }
        Err(e) => Err(e.to_string()),
    };
    system.shutdown().await;
    outcome
}

pub async fn run(config: SwitchyardConfig, options: RunOptions<'_>) -> Result<(), String> {
    let response = execute(config, &options).await?;
    let result = &response.result;

    println!(
        "Workflow {} {}{}",
        result.request_id,
        result.status.as_str(),
        if response.cached { " (cached)" } else { "" }
    );
    if let Some(secs) = result.processing_time {
        println!("   processing time: {:.3}s", secs);
    }
    for (domain, secs) in &result.domain_timings {
        println!("   {:<9} {:.3}s", domain.as_str(), secs);
    }
    println!();
    print_json(&serde_json::to_value(result).map_err(|e| e.to_string())?);

    match result.status {
        ResultStatus::Completed => Ok(()),
        _ => Err(format!(
            "Workflow {} did not complete: {}",
            result.request_id,
            result.error.as_deref().unwrap_or(result.status.as_str())
        )),
    }
}
