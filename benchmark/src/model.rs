//! Request and response shapes of the processing functions, and the results derived from them.
//!
//! Field names on the wire are fixed by the functions. Every response field defaults to its
//! zero value when absent, so a partially filled response still decodes.

use std::fmt;
use std::ops::{Add, AddAssign, Div};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Duration reported for a task whose workflow type is not known.
pub const SENTINEL_DURATION: f64 = 30.0;

/// One remote processing step of a workflow.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Scales an image into an intermediate object.
    ImageScale,
    /// Runs image recognition on a scaled image.
    ImageRecognition,
    /// Splits a video into segments.
    VideoSplit,
    /// Transcodes a single video segment.
    VideoTranscode,
    /// Merges transcoded segments back into one video.
    VideoMerge,
}

impl Stage {
    /// All stages, in the order they appear in reports.
    pub const ALL: [Stage; 5] = [
        Stage::ImageScale,
        Stage::ImageRecognition,
        Stage::VideoSplit,
        Stage::VideoTranscode,
        Stage::VideoMerge,
    ];

    /// Short name used in logs and reports.
    pub fn name(self) -> &'static str {
        match self {
            Stage::ImageScale => "image-scale",
            Stage::ImageRecognition => "image-recognition",
            Stage::VideoSplit => "video-split",
            Stage::VideoTranscode => "video-transcode",
            Stage::VideoMerge => "video-merge",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The duration components of one stage, in seconds.
///
/// `process_duration` holds the stage-specific work: scaling, inference, splitting, transcoding
/// or merging. `duration` is the wall-clock time observed by the caller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Timings {
    pub duration: f64,
    pub code_duration: f64,
    pub download_duration: f64,
    pub process_duration: f64,
    pub upload_duration: f64,
}

impl Add for Timings {
    type Output = Timings;

    fn add(mut self, rhs: Timings) -> Timings {
        self += rhs;
        self
    }
}

impl AddAssign for Timings {
    fn add_assign(&mut self, rhs: Timings) {
        self.duration += rhs.duration;
        self.code_duration += rhs.code_duration;
        self.download_duration += rhs.download_duration;
        self.process_duration += rhs.process_duration;
        self.upload_duration += rhs.upload_duration;
    }
}

impl Div<f64> for Timings {
    type Output = Timings;

    fn div(self, rhs: f64) -> Timings {
        Timings {
            duration: self.duration / rhs,
            code_duration: self.code_duration / rhs,
            download_duration: self.download_duration / rhs,
            process_duration: self.process_duration / rhs,
            upload_duration: self.upload_duration / rhs,
        }
    }
}

/// A decoded function response.
pub trait StageResponse:
    Clone + fmt::Debug + Default + DeserializeOwned + Serialize + Send + Sync + 'static
{
    /// The durations reported by the function itself. `duration` is left at zero.
    fn timings(&self) -> Timings;
}

/// Request body of the image-scale function.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ImageScaleRequest {
    pub bucket: String,
    pub source: String,
    pub destination: String,
    pub force_remote: bool,
    pub force_backup: bool,
}

/// Request body of the image-recognition function.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ImageRecognitionRequest {
    pub bucket: String,
    pub source: String,
    pub force_remote: bool,
    pub force_backup: bool,
}

/// Request body shared by the video split, transcode and merge functions.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VideoRequest {
    pub bucket: String,
    pub source: String,
    pub destination: String,
    pub force_remote: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageScaleResponse {
    pub force_remote: bool,
    pub code_duration: f64,
    pub download_duration: f64,
    pub scale_duration: f64,
    pub upload_duration: f64,
}

impl StageResponse for ImageScaleResponse {
    fn timings(&self) -> Timings {
        Timings {
            duration: 0.0,
            code_duration: self.code_duration,
            download_duration: self.download_duration,
            process_duration: self.scale_duration,
            upload_duration: self.upload_duration,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageRecognitionResponse {
    pub predictions: Vec<String>,
    pub force_remote: bool,
    pub short_result: bool,
    pub code_duration: f64,
    pub download_duration: f64,
    pub inference_duration: f64,
}

impl StageResponse for ImageRecognitionResponse {
    fn timings(&self) -> Timings {
        Timings {
            duration: 0.0,
            code_duration: self.code_duration,
            download_duration: self.download_duration,
            process_duration: self.inference_duration,
            upload_duration: 0.0,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoSplitResponse {
    pub force_remote: bool,
    pub code_duration: f64,
    pub download_duration: f64,
    pub split_duration: f64,
    pub upload_duration: f64,
}

impl StageResponse for VideoSplitResponse {
    fn timings(&self) -> Timings {
        Timings {
            duration: 0.0,
            code_duration: self.code_duration,
            download_duration: self.download_duration,
            process_duration: self.split_duration,
            upload_duration: self.upload_duration,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoTranscodeResponse {
    pub force_remote: bool,
    pub code_duration: f64,
    pub download_duration: f64,
    pub transcode_duration: f64,
    pub upload_duration: f64,
}

impl StageResponse for VideoTranscodeResponse {
    fn timings(&self) -> Timings {
        Timings {
            duration: 0.0,
            code_duration: self.code_duration,
            download_duration: self.download_duration,
            process_duration: self.transcode_duration,
            upload_duration: self.upload_duration,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoMergeResponse {
    pub force_remote: bool,
    pub code_duration: f64,
    pub download_duration: f64,
    pub merge_duration: f64,
    pub upload_duration: f64,
}

impl StageResponse for VideoMergeResponse {
    fn timings(&self) -> Timings {
        Timings {
            duration: 0.0,
            code_duration: self.code_duration,
            download_duration: self.download_duration,
            process_duration: self.merge_duration,
            upload_duration: self.upload_duration,
        }
    }
}

/// How a function response body was handled.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    /// The body decoded into the expected shape.
    #[default]
    Ok,
    /// The body was not valid JSON for the expected shape. The response is zero-valued.
    Malformed,
    /// The body exceeded the configured maximum size. The response is zero-valued.
    Truncated,
}

impl ResponseStatus {
    pub fn is_degraded(self) -> bool {
        self != ResponseStatus::Ok
    }
}

/// A function response paired with the wall-clock duration observed around the call.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StageResult<R> {
    /// Seconds from just before sending the request until the response was read.
    pub duration: f64,
    pub response: R,
    pub status: ResponseStatus,
}

impl<R: StageResponse> StageResult<R> {
    /// All duration components of this stage, including the caller-observed duration.
    pub fn timings(&self) -> Timings {
        Timings {
            duration: self.duration,
            ..self.response.timings()
        }
    }
}

impl StageResult<VideoTranscodeResponse> {
    /// Combines the per-segment transcode results into one representative result.
    ///
    /// Every duration component is the arithmetic mean across `parts`. The status is the first
    /// degraded status among the parts, if any.
    pub fn mean(parts: &[Self], force_remote: bool) -> Self {
        let count = parts.len().max(1) as f64;
        let sum = parts
            .iter()
            .map(Self::timings)
            .fold(Timings::default(), Add::add);
        let mean = sum / count;

        let status = parts
            .iter()
            .map(|part| part.status)
            .find(|status| status.is_degraded())
            .unwrap_or_default();

        StageResult {
            duration: mean.duration,
            response: VideoTranscodeResponse {
                force_remote,
                code_duration: mean.code_duration,
                download_duration: mean.download_duration,
                transcode_duration: mean.process_duration,
                upload_duration: mean.upload_duration,
            },
            status,
        }
    }
}

/// The outcome of one workflow execution.
///
/// Stages that the workflow does not run keep their zero value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Start of the task in microseconds since the Unix epoch.
    pub start_ts: i64,
    /// Seconds from before the first call until after the last call completed.
    pub duration: f64,
    #[serde(rename = "is_result")]
    pub image_scale: StageResult<ImageScaleResponse>,
    #[serde(rename = "ir_result")]
    pub image_recognition: StageResult<ImageRecognitionResponse>,
    #[serde(rename = "vs_result")]
    pub video_split: StageResult<VideoSplitResponse>,
    #[serde(rename = "vt_result")]
    pub video_transcode: StageResult<VideoTranscodeResponse>,
    #[serde(rename = "vm_result")]
    pub video_merge: StageResult<VideoMergeResponse>,
}

impl TaskResult {
    /// The placeholder result for a task whose workflow type is not known.
    pub fn sentinel() -> Self {
        TaskResult {
            start_ts: 0,
            duration: SENTINEL_DURATION,
            ..Default::default()
        }
    }

    /// Timings and response status of every stage, in [`Stage::ALL`] order.
    pub fn stages(&self) -> [(Stage, Timings, ResponseStatus); 5] {
        [
            (
                Stage::ImageScale,
                self.image_scale.timings(),
                self.image_scale.status,
            ),
            (
                Stage::ImageRecognition,
                self.image_recognition.timings(),
                self.image_recognition.status,
            ),
            (
                Stage::VideoSplit,
                self.video_split.timings(),
                self.video_split.status,
            ),
            (
                Stage::VideoTranscode,
                self.video_transcode.timings(),
                self.video_transcode.status,
            ),
            (
                Stage::VideoMerge,
                self.video_merge.timings(),
                self.video_merge.status,
            ),
        ]
    }
}
