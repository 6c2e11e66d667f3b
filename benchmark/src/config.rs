//! Configuration for a benchmark run.
//!
//! Configuration is loaded once at startup from several sources with the following precedence
//! (highest to lowest):
//!
//! 1. Command line flags
//! 2. Environment variables (prefixed with `BENCH__`)
//! 3. YAML configuration file (specified via `-c` or `--config` flag)
//! 4. Defaults
//!
//! Environment variables use double underscores (`__`) to denote nested structures, for example
//! `BENCH__ENDPOINTS__IMAGE_SCALE__MEMORY=http://localhost:8080`.
//!
//! ```yaml
//! bucket: stress-benchmark
//! source: larger_image
//! tasks: 100
//! distribution: poisson
//! rate: 2.0
//! workflow_type: VideoProcessing
//!
//! endpoints:
//!   video_split:
//!     memory: http://video-split.default.127.0.0.1.sslip.io
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use bytesize::ByteSize;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::model::Stage;

/// Environment variable prefix for all configuration options.
const ENV_PREFIX: &str = "BENCH__";

/// Upper bound for the concurrency limit, imposed by the semaphore gating admission.
pub const MAX_CONCURRENCY: usize = {
    let max = tokio::sync::Semaphore::MAX_PERMITS;
    if max < u32::MAX as usize { max } else { u32::MAX as usize }
};

/// The policy governing when each task is admitted.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Distribution {
    /// Exponentially distributed inter-arrival delays, bounded by the concurrency limit.
    Poisson,
    /// All tasks at once, without delay or concurrency limit.
    Burst,
    /// One task at a time.
    Sequential,
}

/// Error returned when parsing an unknown distribution name.
#[derive(Clone, Debug)]
pub struct DistributionParseError(String);

impl fmt::Display for DistributionParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            r#"invalid distribution "{}": expected one of "poisson", "burst", "seq", "sequential""#,
            self.0
        )
    }
}

impl std::error::Error for DistributionParseError {}

impl std::str::FromStr for Distribution {
    type Err = DistributionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let result = match s {
            s if s.eq_ignore_ascii_case("poisson") => Distribution::Poisson,
            s if s.eq_ignore_ascii_case("burst") => Distribution::Burst,
            s if s.eq_ignore_ascii_case("seq") => Distribution::Sequential,
            s if s.eq_ignore_ascii_case("sequential") => Distribution::Sequential,
            s => return Err(DistributionParseError(s.into())),
        };

        Ok(result)
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Distribution::Poisson => "poisson",
            Distribution::Burst => "burst",
            Distribution::Sequential => "sequential",
        })
    }
}

/// The pipeline shape executed by every task.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum WorkflowType {
    /// Image scale followed by image recognition.
    ImageProcessing,
    /// Video split, five parallel transcodes, then merge.
    VideoProcessing,
    /// Any other name. Tasks of this type yield a placeholder result without calling out.
    Unknown(String),
}

impl std::str::FromStr for WorkflowType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "ImageProcessing" => WorkflowType::ImageProcessing,
            "VideoProcessing" => WorkflowType::VideoProcessing,
            other => WorkflowType::Unknown(other.to_owned()),
        })
    }
}

impl fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowType::ImageProcessing => f.write_str("ImageProcessing"),
            WorkflowType::VideoProcessing => f.write_str("VideoProcessing"),
            WorkflowType::Unknown(name) => f.write_str(name),
        }
    }
}

/// The two deployment variants of a function.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Endpoint {
    /// URL of the memory-backed variant.
    pub memory: String,
    /// URL of the disk-backed variant. Falls back to [`memory`](Self::memory) when unset.
    #[serde(default)]
    pub disk: Option<String>,
}

impl Endpoint {
    fn new(memory: &str, disk: Option<&str>) -> Self {
        Self {
            memory: memory.to_owned(),
            disk: disk.map(str::to_owned),
        }
    }

    /// Returns the URL of the selected variant.
    pub fn select(&self, use_mem: bool) -> &str {
        match (&self.disk, use_mem) {
            (Some(disk), false) => disk,
            _ => &self.memory,
        }
    }
}

/// Endpoints of all processing functions.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Endpoints {
    pub image_scale: Endpoint,
    pub image_recognition: Endpoint,
    pub video_split: Endpoint,
    pub video_transcode: Endpoint,
    pub video_merge: Endpoint,
}

impl Endpoints {
    pub fn get(&self, stage: Stage) -> &Endpoint {
        match stage {
            Stage::ImageScale => &self.image_scale,
            Stage::ImageRecognition => &self.image_recognition,
            Stage::VideoSplit => &self.video_split,
            Stage::VideoTranscode => &self.video_transcode,
            Stage::VideoMerge => &self.video_merge,
        }
    }

    /// Points every stage at `base_url`, using the stage name as the path.
    ///
    /// Disk variants get a `-disk` suffix.
    pub fn with_base_url(base_url: &str) -> Self {
        let base_url = base_url.trim_end_matches('/');
        let endpoint = |stage: Stage| {
            let memory = format!("{base_url}/{stage}");
            let disk = format!("{base_url}/{stage}-disk");
            Endpoint::new(&memory, Some(&disk))
        };

        Self {
            image_scale: endpoint(Stage::ImageScale),
            image_recognition: endpoint(Stage::ImageRecognition),
            video_split: endpoint(Stage::VideoSplit),
            video_transcode: endpoint(Stage::VideoTranscode),
            video_merge: endpoint(Stage::VideoMerge),
        }
    }
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            image_scale: Endpoint::new(
                "http://image-scale.default.127.0.0.1.sslip.io",
                Some("http://image-scale-disk.default.127.0.0.1.sslip.io"),
            ),
            image_recognition: Endpoint::new(
                "http://image-recognition.default.127.0.0.1.sslip.io",
                Some("http://image-recognition-disk.default.127.0.0.1.sslip.io"),
            ),
            video_split: Endpoint::new("http://video-split.default.127.0.0.1.sslip.io", None),
            video_transcode: Endpoint::new(
                "http://video-transcode.default.127.0.0.1.sslip.io",
                None,
            ),
            video_merge: Endpoint::new("http://video-merge.default.127.0.0.1.sslip.io", None),
        }
    }
}

/// Log output format.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Pretty output on a TTY, simplified otherwise.
    Auto,
    /// Compact output with colors.
    Pretty,
    /// Plain text output without colors.
    Simplified,
    /// JSON lines.
    Json,
}

/// Logging configuration.
///
/// Controls the console output on stderr. The run log file always receives JSON lines.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Logging {
    /// Minimum log level written to stderr.
    ///
    /// The `RUST_LOG` environment variable overrides this with per-module directives.
    #[serde(with = "display_fromstr")]
    pub level: LevelFilter,

    /// Format of the console output.
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

mod display_fromstr {
    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
        T: std::fmt::Display,
    {
        serializer.collect_str(&value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        D: serde::Deserializer<'de>,
        T: std::str::FromStr,
        <T as std::str::FromStr>::Err: std::fmt::Display,
    {
        use serde::Deserialize;
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Main configuration struct for a benchmark run.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Bucket holding the source objects and receiving all outputs.
    pub bucket: String,
    /// Key of the source object. Derived keys are built from it.
    pub source: String,

    /// Maximum number of tasks in flight under the Poisson distribution.
    pub concurrency: usize,
    /// Number of workflow runs in the timed experiment. Must be positive.
    pub tasks: usize,
    /// Arrival policy of the tasks.
    #[serde(with = "display_fromstr")]
    pub distribution: Distribution,
    /// Arrival rate per second of the Poisson process.
    pub rate: f64,
    /// Seed for the inter-arrival sampling. Random when unset.
    pub seed: Option<u64>,

    /// Instructs the functions to bypass any local execution path.
    pub force_remote: bool,
    /// Selects memory-backed function variants instead of disk-backed ones.
    pub use_mem: bool,
    /// The pipeline executed by every task.
    #[serde(with = "display_fromstr")]
    pub workflow_type: WorkflowType,

    /// Runs [`warmup_tasks`](Self::warmup_tasks) discarded workflows before the experiment.
    pub warmup: bool,
    pub warmup_tasks: usize,

    /// Largest response body that is decoded. Larger bodies are marked as truncated.
    pub max_response_size: ByteSize,

    /// Directory receiving the timestamped run log.
    pub log_dir: PathBuf,
    pub logging: Logging,

    pub endpoints: Endpoints,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bucket: "stress-benchmark".into(),
            source: "larger_image".into(),

            concurrency: i32::MAX as usize,
            tasks: 5,
            distribution: Distribution::Poisson,
            rate: 0.5,
            seed: None,

            force_remote: false,
            use_mem: false,
            workflow_type: WorkflowType::ImageProcessing,

            warmup: false,
            warmup_tasks: 10,

            max_response_size: ByteSize::kib(64),

            log_dir: PathBuf::from("logs"),
            logging: Logging::default(),

            endpoints: Endpoints::default(),
        }
    }
}

/// Values passed on the command line, overriding all other sources.
///
/// Unset fields are not serialized and therefore leave lower-precedence values in place.
#[derive(Debug, Default, Serialize)]
pub struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tasks: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distribution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_type: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub force_remote: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub use_mem: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub warmup: bool,
}

impl Config {
    /// Loads configuration from the provided arguments.
    ///
    /// Returns an error if the YAML file cannot be read or parsed, if any source contains an
    /// invalid value, or if the resulting configuration fails [validation](Self::validate).
    pub fn load(path: Option<&Path>, overrides: Overrides) -> Result<Self> {
        let mut figment = figment::Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config: Config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .merge(Serialized::defaults(overrides))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations that cannot produce a meaningful run.
    pub fn validate(&self) -> Result<()> {
        if self.tasks == 0 {
            bail!("tasks must be at least 1");
        }
        if self.concurrency == 0 {
            bail!("concurrency must be at least 1");
        }
        if self.distribution == Distribution::Poisson && !(self.rate.is_finite() && self.rate > 0.0)
        {
            bail!("poisson rate must be a positive number, got {}", self.rate);
        }
        Ok(())
    }

    /// The concurrency limit, clamped to what the admission semaphore supports.
    pub fn concurrency_limit(&self) -> usize {
        self.concurrency.min(MAX_CONCURRENCY)
    }
}
