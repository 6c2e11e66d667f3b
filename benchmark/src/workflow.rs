//! Composes function calls into the image and video processing pipelines.
//!
//! All object keys written by a task are derived from the source key and the task index, so
//! concurrent tasks never write to the same key.

use std::sync::Arc;

use tokio::time::Instant;

use crate::config::{Config, Endpoints, WorkflowType};
use crate::error::Result;
use crate::http::FunctionClient;
use crate::model::{
    ImageRecognitionRequest, ImageRecognitionResponse, ImageScaleRequest, ImageScaleResponse,
    Stage, StageResult, TaskResult, VideoMergeResponse, VideoRequest, VideoSplitResponse,
    VideoTranscodeResponse,
};
use crate::observability::unix_micros;

/// Number of segments a video is split into, each transcoded in parallel.
pub const TRANSCODE_FAN_OUT: usize = 5;

#[derive(Debug)]
struct Settings {
    bucket: String,
    force_remote: bool,
    use_mem: bool,
    endpoints: Endpoints,
}

/// Runs one workflow per task against the processing functions.
///
/// Cloning is cheap, all clones share the same client and settings.
#[derive(Clone, Debug)]
pub struct Orchestrator {
    client: FunctionClient,
    settings: Arc<Settings>,
}

impl Orchestrator {
    pub fn new(client: FunctionClient, config: &Config) -> Self {
        let settings = Settings {
            bucket: config.bucket.clone(),
            force_remote: config.force_remote,
            use_mem: config.use_mem,
            endpoints: config.endpoints.clone(),
        };

        Self {
            client,
            settings: Arc::new(settings),
        }
    }

    fn endpoint(&self, stage: Stage) -> &str {
        self.settings
            .endpoints
            .get(stage)
            .select(self.settings.use_mem)
    }

    /// Executes the workflow for task `index` on the object `source`.
    ///
    /// An unknown workflow type makes no calls and yields [`TaskResult::sentinel`].
    pub async fn run_task(
        &self,
        index: usize,
        source: &str,
        workflow: &WorkflowType,
    ) -> Result<TaskResult> {
        tracing::debug!(index, %workflow, "task started");

        let result = match workflow {
            WorkflowType::ImageProcessing => self.image_processing(index, source).await?,
            WorkflowType::VideoProcessing => self.video_processing(index, source).await?,
            WorkflowType::Unknown(name) => {
                tracing::warn!(index, workflow = %name, "unknown workflow type");
                return Ok(TaskResult::sentinel());
            }
        };

        tracing::debug!(index, duration = result.duration, "task finished");
        Ok(result)
    }

    async fn image_processing(&self, index: usize, source: &str) -> Result<TaskResult> {
        let Settings {
            bucket,
            force_remote,
            ..
        } = &*self.settings;
        let intermediate = derived_key(source, index, "scaled");

        let start_ts = unix_micros();
        let start = Instant::now();

        let scale_request = ImageScaleRequest {
            bucket: bucket.clone(),
            source: source.to_owned(),
            destination: intermediate.clone(),
            force_remote: *force_remote,
            force_backup: false,
        };
        let image_scale: StageResult<ImageScaleResponse> = self
            .client
            .invoke(self.endpoint(Stage::ImageScale), &scale_request)
            .await?;

        let recognition_request = ImageRecognitionRequest {
            bucket: bucket.clone(),
            source: intermediate,
            force_remote: *force_remote,
            force_backup: false,
        };
        let image_recognition: StageResult<ImageRecognitionResponse> = self
            .client
            .invoke(self.endpoint(Stage::ImageRecognition), &recognition_request)
            .await?;

        Ok(TaskResult {
            start_ts,
            duration: start.elapsed().as_secs_f64(),
            image_scale,
            image_recognition,
            ..Default::default()
        })
    }

    async fn video_processing(&self, index: usize, source: &str) -> Result<TaskResult> {
        let Settings {
            bucket,
            force_remote,
            ..
        } = &*self.settings;
        let split_dst = derived_key(source, index, "splitted");
        let merge_src = derived_key(source, index, "transcoded");
        let merge_dst = derived_key(source, index, "merged");

        let start_ts = unix_micros();
        let start = Instant::now();

        let split_request = VideoRequest {
            bucket: bucket.clone(),
            source: source.to_owned(),
            destination: split_dst.clone(),
            force_remote: *force_remote,
        };
        let video_split: StageResult<VideoSplitResponse> = self
            .client
            .invoke(self.endpoint(Stage::VideoSplit), &split_request)
            .await?;

        let transcode_endpoint = self.endpoint(Stage::VideoTranscode);
        let transcodes = (1..=TRANSCODE_FAN_OUT).map(|segment| {
            let request = VideoRequest {
                bucket: bucket.clone(),
                source: segment_key(&split_dst, segment),
                destination: merge_src.clone(),
                force_remote: *force_remote,
            };
            async move {
                self.client
                    .invoke::<_, VideoTranscodeResponse>(transcode_endpoint, &request)
                    .await
            }
        });
        let segments = futures::future::try_join_all(transcodes).await?;
        let video_transcode = StageResult::mean(&segments, *force_remote);

        let merge_request = VideoRequest {
            bucket: bucket.clone(),
            source: merge_src,
            destination: merge_dst,
            force_remote: *force_remote,
        };
        let video_merge: StageResult<VideoMergeResponse> = self
            .client
            .invoke(self.endpoint(Stage::VideoMerge), &merge_request)
            .await?;

        Ok(TaskResult {
            start_ts,
            duration: start.elapsed().as_secs_f64(),
            video_split,
            video_transcode,
            video_merge,
            ..Default::default()
        })
    }
}

fn derived_key(source: &str, index: usize, suffix: &str) -> String {
    format!("{source}_{index}-{suffix}")
}

fn segment_key(split_dst: &str, segment: usize) -> String {
    format!("{split_dst}/seg{segment}_sample.mp4")
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{Value, json};

    use super::*;
    use crate::model::ResponseStatus;
    use crate::testutils::{MockReply, MockTransport, assert_secs};

    fn orchestrator(transport: Arc<MockTransport>, config: &Config) -> Orchestrator {
        Orchestrator::new(FunctionClient::new(transport, 64 * 1024), config)
    }

    fn secs(secs: f64) -> Duration {
        Duration::from_secs_f64(secs)
    }

    fn image_handler(endpoint: &str, _body: &Value) -> MockReply {
        if endpoint.contains("image-scale") {
            MockReply::json(
                secs(1.0),
                json!({"code_duration": 0.8, "download_duration": 0.1, "scale_duration": 0.5, "upload_duration": 0.1}),
            )
        } else {
            MockReply::json(
                secs(2.0),
                json!({"predictions": ["dog"], "code_duration": 1.5, "inference_duration": 1.0}),
            )
        }
    }

    #[tokio::test(start_paused = true)]
    async fn image_pipeline_chains_keys() {
        let transport = MockTransport::new(image_handler);
        let config = Config {
            bucket: "bucket".into(),
            force_remote: true,
            ..Default::default()
        };

        let result = orchestrator(transport.clone(), &config)
            .run_task(3, "img", &WorkflowType::ImageProcessing)
            .await
            .unwrap();

        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[0].endpoint,
            "http://image-scale-disk.default.127.0.0.1.sslip.io"
        );
        assert_eq!(
            calls[0].body,
            json!({
                "bucket": "bucket",
                "source": "img",
                "destination": "img_3-scaled",
                "force_remote": true,
                "force_backup": false,
            })
        );
        assert_eq!(
            calls[1].endpoint,
            "http://image-recognition-disk.default.127.0.0.1.sslip.io"
        );
        assert_eq!(calls[1].body["source"], "img_3-scaled");
        assert!(calls[1].body.get("destination").is_none());

        assert_secs(result.image_scale.duration, 1.0);
        assert_eq!(result.image_scale.response.scale_duration, 0.5);
        assert_secs(result.image_recognition.duration, 2.0);
        assert_eq!(result.image_recognition.response.predictions, ["dog"]);
        assert_secs(result.duration, 3.0);
        assert!(result.start_ts > 0);
        assert_eq!(result.video_split, StageResult::default());
    }

    #[tokio::test(start_paused = true)]
    async fn memory_variant_is_selected() {
        let transport = MockTransport::new(image_handler);
        let config = Config {
            use_mem: true,
            ..Default::default()
        };

        orchestrator(transport.clone(), &config)
            .run_task(0, "img", &WorkflowType::ImageProcessing)
            .await
            .unwrap();

        let calls = transport.calls();
        assert_eq!(calls[0].endpoint, "http://image-scale.default.127.0.0.1.sslip.io");
        assert_eq!(
            calls[1].endpoint,
            "http://image-recognition.default.127.0.0.1.sslip.io"
        );
    }

    fn segment_of(body: &Value) -> usize {
        let source = body["source"].as_str().unwrap();
        let name = source.rsplit('/').next().unwrap();
        name.trim_start_matches("seg")
            .trim_end_matches("_sample.mp4")
            .parse()
            .unwrap()
    }

    fn video_handler(endpoint: &str, body: &Value) -> MockReply {
        if endpoint.contains("video-split") {
            MockReply::json(secs(1.0), json!({"split_duration": 0.5}))
        } else if endpoint.contains("video-transcode") {
            // earlier segments finish later
            let segment = segment_of(body) as f64;
            MockReply::json(
                secs(6.0 - segment),
                json!({
                    "code_duration": segment,
                    "download_duration": segment * 2.0,
                    "transcode_duration": segment * 3.0,
                    "upload_duration": segment * 4.0,
                }),
            )
        } else {
            MockReply::json(secs(2.0), json!({"merge_duration": 1.5}))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn video_pipeline_fans_out_and_averages() {
        let transport = MockTransport::new(video_handler);

        let result = orchestrator(transport.clone(), &Config::default())
            .run_task(7, "clip", &WorkflowType::VideoProcessing)
            .await
            .unwrap();

        let calls = transport.calls();
        assert_eq!(calls.len(), 2 + TRANSCODE_FAN_OUT);

        assert!(calls[0].endpoint.contains("video-split"));
        assert_eq!(calls[0].body["source"], "clip");
        assert_eq!(calls[0].body["destination"], "clip_7-splitted");

        let mut segments: Vec<_> = calls[1..=TRANSCODE_FAN_OUT]
            .iter()
            .map(|call| {
                assert!(call.endpoint.contains("video-transcode"));
                assert_eq!(call.body["destination"], "clip_7-transcoded");
                call.body["source"].as_str().unwrap().to_owned()
            })
            .collect();
        segments.sort();
        let expected: Vec<_> = (1..=5)
            .map(|n| format!("clip_7-splitted/seg{n}_sample.mp4"))
            .collect();
        assert_eq!(segments, expected);

        let merge = &calls[6];
        assert!(merge.endpoint.contains("video-merge"));
        assert_eq!(merge.body["source"], "clip_7-transcoded");
        assert_eq!(merge.body["destination"], "clip_7-merged");

        // mean over segments 1..=5 is 3, mean delay is also 3 seconds
        let transcode = &result.video_transcode;
        assert_secs(transcode.duration, 3.0);
        assert_eq!(transcode.response.code_duration, 3.0);
        assert_eq!(transcode.response.download_duration, 6.0);
        assert_eq!(transcode.response.transcode_duration, 9.0);
        assert_eq!(transcode.response.upload_duration, 12.0);

        assert_secs(result.video_split.duration, 1.0);
        assert_eq!(result.video_merge.response.merge_duration, 1.5);
        // split, slowest segment, merge
        assert_secs(result.duration, 1.0 + 5.0 + 2.0);
        assert_eq!(result.image_scale, StageResult::default());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_workflow_yields_sentinel() {
        let transport = MockTransport::new(image_handler);

        let result = orchestrator(transport.clone(), &Config::default())
            .run_task(0, "img", &WorkflowType::Unknown("Transcription".into()))
            .await
            .unwrap();

        assert_eq!(result, TaskResult::sentinel());
        assert_eq!(result.duration, 30.0);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_response_does_not_abort() {
        let transport = MockTransport::new(|endpoint, _body| {
            if endpoint.contains("image-scale") {
                MockReply {
                    delay: Duration::from_secs(1),
                    body: "not-json".into(),
                }
            } else {
                MockReply::json(Duration::from_secs(1), json!({"code_duration": 0.7}))
            }
        });

        let result = orchestrator(transport.clone(), &Config::default())
            .run_task(0, "img", &WorkflowType::ImageProcessing)
            .await
            .unwrap();

        assert_eq!(result.image_scale.status, ResponseStatus::Malformed);
        assert_eq!(result.image_scale.response, Default::default());
        assert_secs(result.image_scale.duration, 1.0);
        assert_eq!(result.image_recognition.status, ResponseStatus::Ok);
        assert_eq!(result.image_recognition.response.code_duration, 0.7);
        assert_eq!(transport.calls().len(), 2);
    }
}
