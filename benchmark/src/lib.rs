//! A load generator for a serverless media pipeline.
//!
//! Each task runs one workflow against the processing functions. The image workflow scales an
//! image and then classifies the scaled result. The video workflow splits a video, transcodes the
//! segments in parallel and merges them again. Tasks are issued according to a
//! [`Distribution`](config::Distribution), either following a Poisson process with bounded
//! concurrency, all at once, or one after the other.
//!
//! Every function reports how it spent its time. Per-task records are written to the run log,
//! and the means across all tasks are reduced into a [`RunSummary`].
#![warn(missing_debug_implementations)]

use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tokio::time::Instant;

pub mod arrival;
pub mod config;
pub mod error;
pub mod http;
pub mod model;
pub mod observability;
pub mod report;
pub mod workflow;

#[cfg(test)]
mod testutils;

use crate::arrival::{ArrivalPlan, Scheduler};
use crate::config::Config;
use crate::http::{FunctionClient, Transport};
use crate::observability::RunLog;
use crate::workflow::Orchestrator;

pub use crate::error::{Error, Result};
pub use crate::report::RunSummary;

#[derive(Serialize)]
struct SummaryRecord<'a> {
    summary: &'a RunSummary,
}

/// Runs the benchmark described by `config`, sending all requests through `transport`.
///
/// Every task of the experiment and the final summary are recorded in `run_log`. If warm-up is
/// enabled, [`warmup_tasks`](Config::warmup_tasks) tasks are issued all at once beforehand. Their
/// results are discarded and their time is not part of the summary.
pub async fn run(
    config: &Config,
    transport: Arc<dyn Transport>,
    run_log: &RunLog,
) -> Result<RunSummary> {
    let max_response_size =
        usize::try_from(config.max_response_size.as_u64()).unwrap_or(usize::MAX);
    let client = FunctionClient::new(transport, max_response_size);
    let orchestrator = Orchestrator::new(client, config);

    if config.warmup && config.warmup_tasks > 0 {
        tracing::info!(tasks = config.warmup_tasks, "warming up");
        Scheduler::new(orchestrator.clone(), config)
            .run(&ArrivalPlan::warmup(config))
            .await?;
    }

    let plan = ArrivalPlan::from_config(config);
    tracing::info!(
        tasks = plan.tasks,
        distribution = %plan.distribution,
        seed = plan.seed,
        workflow = %config.workflow_type,
        "starting experiment"
    );

    let progress = progress_bar(plan.tasks);
    let scheduler = Scheduler::new(orchestrator, config)
        .with_progress(progress.clone())
        .with_run_log(run_log.clone());

    let start = Instant::now();
    let results = scheduler.run(&plan).await;
    let duration = start.elapsed();
    progress.finish_and_clear();

    let summary = report::summarize(&results?, duration);
    run_log.record("run completed", &SummaryRecord { summary: &summary })?;

    Ok(summary)
}

fn progress_bar(tasks: usize) -> ProgressBar {
    let bar = ProgressBar::new(tasks as u64).with_message("Running tasks:");
    if let Ok(style) = ProgressStyle::with_template("{msg} {wide_bar} {pos}/{len} {elapsed}") {
        bar.set_style(style);
    }
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}
