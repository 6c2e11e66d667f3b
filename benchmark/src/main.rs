//! Runs the media pipeline benchmark and prints a summary of where the time went.
//!
//! The configuration is layered from defaults, an optional YAML file, `BENCH__` environment
//! variables and the flags below, in increasing order of precedence.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use argh::FromArgs;

use benchmark::config::{Config, Overrides};
use benchmark::http::HttpTransport;
use benchmark::{observability, report};

/// Load generator for the serverless image and video pipeline
#[derive(Debug, FromArgs)]
struct Args {
    /// path to the YAML configuration file
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,

    /// bucket holding the source objects
    #[argh(option)]
    bucket: Option<String>,

    /// key of the source object
    #[argh(option)]
    source: Option<String>,

    /// maximum number of tasks in flight under the poisson distribution
    #[argh(option)]
    concurrency: Option<usize>,

    /// number of tasks in the experiment
    #[argh(option)]
    tasks: Option<usize>,

    /// arrival distribution: poisson, burst, or seq
    #[argh(option)]
    distribution: Option<String>,

    /// expected arrivals per second of the poisson process
    #[argh(option)]
    rate: Option<f64>,

    /// workflow type: ImageProcessing or VideoProcessing
    #[argh(option)]
    workflow_type: Option<String>,

    /// let the functions bypass their local execution path
    #[argh(switch)]
    force_remote: bool,

    /// use the memory-backed function variants
    #[argh(switch)]
    use_mem: bool,

    /// run discarded warm-up tasks before the experiment
    #[argh(switch)]
    warmup: bool,
}

impl From<Args> for Overrides {
    fn from(args: Args) -> Self {
        Self {
            bucket: args.bucket,
            source: args.source,
            concurrency: args.concurrency,
            tasks: args.tasks,
            distribution: args.distribution,
            rate: args.rate,
            workflow_type: args.workflow_type,
            force_remote: args.force_remote,
            use_mem: args.use_mem,
            warmup: args.warmup,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args: Args = argh::from_env();
    let path = args.config.take();

    let config =
        Config::load(path.as_deref(), args.into()).context("failed to load configuration")?;
    let (run_log, log_path) = observability::init_tracing(&config)?;

    let options = serde_json::to_string(&config)?;
    tracing::info!(%options, "loaded configuration");

    let transport = Arc::new(HttpTransport::new());
    let summary = benchmark::run(&config, transport, &run_log).await?;

    report::print_summary(&summary);
    println!();
    println!("Run log written to {}", log_path.display());

    Ok(())
}
