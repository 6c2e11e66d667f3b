//! Reduces per-task results into a [`RunSummary`] and prints it.

use std::time::Duration;

use serde::Serialize;
use sketches_ddsketch::DDSketch;
use yansi::Paint;

use crate::model::{Stage, TaskResult, Timings};

/// Sums and means of one stage across all tasks.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StageSummary {
    pub stage: Stage,
    pub total: Timings,
    pub average: Timings,
    /// Number of responses of this stage that were malformed or truncated.
    pub degraded: usize,
}

/// Quantiles of the task durations, in seconds.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Percentiles {
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
}

/// The final report of a run.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunSummary {
    /// Wall-clock seconds of the whole experiment.
    pub duration: f64,
    pub tasks: usize,
    /// Sum of the task durations.
    pub total_duration: f64,
    /// Mean of the task durations.
    pub average_duration: f64,
    pub percentiles: Option<Percentiles>,
    /// One entry per stage, in [`Stage::ALL`] order.
    pub stages: Vec<StageSummary>,
}

impl RunSummary {
    pub fn stage(&self, stage: Stage) -> &StageSummary {
        &self.stages[stage as usize]
    }
}

/// Sums every duration component across `results` and divides by the number of tasks.
///
/// Stages a workflow does not run contribute zeros. An empty `results` yields zero means.
pub fn summarize(results: &[TaskResult], duration: Duration) -> RunSummary {
    let mut sketch = DDSketch::default();
    let mut total_duration = 0.0;
    let mut totals = [Timings::default(); Stage::ALL.len()];
    let mut degraded = [0; Stage::ALL.len()];

    for result in results {
        sketch.add(result.duration);
        total_duration += result.duration;

        for (stage, timings, status) in result.stages() {
            totals[stage as usize] += timings;
            if status.is_degraded() {
                degraded[stage as usize] += 1;
            }
        }
    }

    // totals are zero without results, so the means are zero as well
    let count = results.len();
    let divisor = count.max(1) as f64;

    let stages = Stage::ALL
        .iter()
        .map(|&stage| StageSummary {
            stage,
            total: totals[stage as usize],
            average: totals[stage as usize] / divisor,
            degraded: degraded[stage as usize],
        })
        .collect();

    RunSummary {
        duration: duration.as_secs_f64(),
        tasks: count,
        total_duration,
        average_duration: total_duration / divisor,
        percentiles: percentiles(&sketch),
        stages,
    }
}

fn percentiles(sketch: &DDSketch) -> Option<Percentiles> {
    let quantile = |q| sketch.quantile(q).ok().flatten();
    Some(Percentiles {
        p50: quantile(0.5)?,
        p90: quantile(0.9)?,
        p99: quantile(0.99)?,
    })
}

/// Prints the summary to stdout.
pub fn print_summary(summary: &RunSummary) {
    println!();
    println!(
        "{} ({} tasks in {:.2}s)",
        "## SUMMARY".bold(),
        summary.tasks.bold(),
        summary.duration
    );
    print!("  task avg: {:.3}s", summary.average_duration.bold());
    if let Some(Percentiles { p50, p90, p99 }) = &summary.percentiles {
        print!("; p50: {p50:.3}s; p90: {p90:.3}s; p99: {p99:.3}s");
    }
    println!();

    // stages not part of the workflow have no caller-observed duration
    for stage in summary.stages.iter().filter(|s| s.total.duration > 0.0) {
        print!("{}", format!("{}:", stage.stage).bold().green());
        if stage.degraded > 0 {
            print!(
                " {}",
                format!("{} DEGRADED", stage.degraded).bold().red()
            );
        }
        println!();

        let Timings {
            duration,
            code_duration,
            download_duration,
            process_duration,
            upload_duration,
        } = stage.average;
        println!(
            "  avg: {:.3}s; code: {code_duration:.3}s; download: {download_duration:.3}s; \
             process: {process_duration:.3}s; upload: {upload_duration:.3}s",
            duration.bold()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ImageScaleResponse, ResponseStatus, StageResult, VideoMergeResponse};

    fn image_task(duration: f64, scale: f64) -> TaskResult {
        TaskResult {
            start_ts: 1,
            duration,
            image_scale: StageResult {
                duration: scale,
                response: ImageScaleResponse {
                    force_remote: false,
                    code_duration: scale / 2.0,
                    download_duration: 0.1,
                    scale_duration: 0.2,
                    upload_duration: 0.3,
                },
                status: ResponseStatus::Ok,
            },
            ..Default::default()
        }
    }

    #[test]
    fn averages_are_sums_divided_by_task_count() {
        let results: Vec<_> = (1..=7)
            .map(|i| image_task(i as f64 * 1.5, i as f64 * 0.25))
            .collect();
        let summary = summarize(&results, Duration::from_secs(20));

        assert_eq!(summary.tasks, 7);
        assert_eq!(summary.duration, 20.0);
        let n = results.len() as f64;
        assert!((summary.average_duration - summary.total_duration / n).abs() < 1e-12);

        for stage in &summary.stages {
            let expected = stage.total / n;
            assert!((stage.average.duration - expected.duration).abs() < 1e-12);
            assert!((stage.average.code_duration - expected.code_duration).abs() < 1e-12);
            assert!((stage.average.upload_duration - expected.upload_duration).abs() < 1e-12);
        }

        let scale = summary.stage(Stage::ImageScale);
        assert!((scale.total.duration - 7.0).abs() < 1e-12);
        assert!((scale.average.duration - 1.0).abs() < 1e-12);
        assert!((scale.average.download_duration - 0.1).abs() < 1e-12);
        assert_eq!(scale.degraded, 0);

        assert_eq!(summary.stage(Stage::VideoMerge).total, Timings::default());
    }

    #[test]
    fn counts_degraded_responses() {
        let mut degraded = image_task(1.0, 1.0);
        degraded.video_merge = StageResult::<VideoMergeResponse> {
            duration: 0.5,
            status: ResponseStatus::Truncated,
            ..Default::default()
        };

        let summary = summarize(&[image_task(1.0, 1.0), degraded], Duration::ZERO);

        assert_eq!(summary.stage(Stage::VideoMerge).degraded, 1);
        assert_eq!(summary.stage(Stage::ImageScale).degraded, 0);
        assert!((summary.stage(Stage::VideoMerge).average.duration - 0.25).abs() < 1e-12);
    }

    #[test]
    fn includes_sentinel_tasks() {
        let summary = summarize(
            &[TaskResult::sentinel(), TaskResult::sentinel()],
            Duration::ZERO,
        );
        assert_eq!(summary.total_duration, 60.0);
        assert_eq!(summary.average_duration, 30.0);
    }

    #[test]
    fn percentiles_of_task_durations() {
        let results: Vec<_> = (1..=100).map(|i| image_task(i as f64, 0.0)).collect();
        let summary = summarize(&results, Duration::ZERO);

        let percentiles = summary.percentiles.unwrap();
        // relative error of 1%, plus one rank of slack
        assert!((percentiles.p50 - 50.0).abs() <= 2.0);
        assert!((percentiles.p90 - 90.0).abs() <= 2.0);
        assert!((percentiles.p99 - 99.0).abs() <= 2.0);
    }

    #[test]
    fn empty_results_have_zero_means() {
        let summary = summarize(&[], Duration::ZERO);
        assert_eq!(summary.tasks, 0);
        assert_eq!(summary.average_duration, 0.0);
        assert_eq!(summary.percentiles, None);
        assert!(summary.stages.iter().all(|s| s.average == Timings::default()));
    }
}
