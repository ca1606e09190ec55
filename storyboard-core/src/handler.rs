use std::sync::Arc;

use anyhow::anyhow;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, info_span, Instrument};

use crate::{
    codec, invoker, ErrorKind, JobError, JobParams, JobResult, LoadSettings, Loader, ModelCache,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSuccess {
    /// Base64 PNG, no data-URI prefix.
    pub image: String,
    pub prompt_used: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobFailure {
    pub error: String,
    #[serde(skip)]
    pub kind: ErrorKind,
}

/// The response envelope: either an image or an error, never both.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JobOutput {
    Success(JobSuccess),
    Failure(JobFailure),
}

impl JobOutput {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Failure(_))
    }
}

/// Entry point for jobs. Holds the model cache and serialises access to the pipeline,
/// which monopolises the accelerator while it runs.
///
/// The gate is held by the blocking generation task itself, so a job whose caller went away
/// still keeps the pipeline until its model call returns.
pub struct Worker<L: Loader> {
    cache: ModelCache<L>,
    gate: Arc<Mutex<()>>,
}

impl<L: Loader> Worker<L> {
    pub fn new(loader: L, settings: LoadSettings) -> Self {
        Self {
            cache: ModelCache::new(loader, settings),
            gate: Arc::new(Mutex::new(())),
        }
    }

    pub fn cache(&self) -> &ModelCache<L> {
        &self.cache
    }

    /// Handles one `{"input": {...}}` envelope. Never fails: errors come back as
    /// `{"error": "..."}` and only affect this job.
    pub async fn handle(&self, envelope: &Value) -> JobOutput {
        let id = envelope
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or("-")
            .to_string();

        let span = info_span!("job", %id);
        match self.try_handle(envelope).instrument(span.clone()).await {
            Ok(success) => JobOutput::Success(success),
            Err(err) => {
                span.in_scope(|| error!(kind = ?err.kind(), error = ?err, "job failed"));
                JobOutput::Failure(JobFailure {
                    error: err.to_string(),
                    kind: err.kind(),
                })
            }
        }
    }

    async fn try_handle(&self, envelope: &Value) -> JobResult<JobSuccess> {
        let input = job_input(envelope)?;
        let params = JobParams::from_input(&input)?;
        debug!(?params, "decoded job");

        let model = self.cache.ensure_loaded().await?;

        let turn = self.gate.clone().lock_owned().await;
        let result = tokio::task::spawn_blocking(move || {
            let result = invoker::generate(model.as_ref(), &params);
            drop(turn);
            result
        })
        .await
            .map_err(|e| JobError::Model(anyhow!("generation task failed: {e}")))??;

        let image = codec::image_to_base64_png(&result.image)?;
        Ok(JobSuccess {
            image,
            prompt_used: result.prompt_used,
            seed: result.seed,
        })
    }
}

/// Pulls the `input` mapping out of an envelope. A missing or null `input` is an empty mapping.
fn job_input(envelope: &Value) -> JobResult<Map<String, Value>> {
    let Value::Object(envelope) = envelope else {
        return Err(JobError::validation("job envelope must be a JSON object"));
    };
    match envelope.get("input") {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(input)) => Ok(input.clone()),
        Some(_) => Err(JobError::validation("'input' must be a JSON object")),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::{cache::tests::FakeLoader, HandlerVariant};

    fn reference_worker() -> (Worker<FakeLoader>, Arc<std::sync::atomic::AtomicUsize>) {
        let loader = FakeLoader::default();
        let loads = loader.loads.clone();
        let settings = LoadSettings {
            variant: HandlerVariant::Reference,
            ..Default::default()
        };
        (Worker::new(loader, settings), loads)
    }

    fn error_of(output: JobOutput) -> JobFailure {
        match output {
            JobOutput::Failure(failure) => failure,
            JobOutput::Success(_) => panic!("expected a failure"),
        }
    }

    fn success_of(output: JobOutput) -> JobSuccess {
        match output {
            JobOutput::Success(success) => success,
            JobOutput::Failure(failure) => panic!("expected success, got {}", failure.error),
        }
    }

    #[tokio::test]
    async fn generates_frame_with_echo_fields() {
        let (worker, _) = reference_worker();
        let output = worker
            .handle(&json!({
                "id": "job-1",
                "input": { "panel_prompt": "A", "character_prompt": "B", "style_prompt": "C",
                           "seed": 7, "width": 64, "height": 64 }
            }))
            .await;
        let success = success_of(output.clone());
        assert_eq!(success.prompt_used, "A. B. C");
        assert_eq!(success.seed, Some(7));

        let decoded = codec::base64_to_image(&success.image).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 64));

        let body = serde_json::to_value(&output).unwrap();
        assert!(body.get("error").is_none());
        assert_eq!(body["seed"], 7);
    }

    #[tokio::test]
    async fn unseeded_output_omits_seed() {
        let (worker, _) = reference_worker();
        let output = worker
            .handle(&json!({ "input": { "prompt": "x", "width": 64, "height": 64 } }))
            .await;
        let body = serde_json::to_value(&output).unwrap();
        assert!(body.get("seed").is_none());
        assert!(body["image"].is_string());
    }

    #[tokio::test]
    async fn missing_description_fails_without_loading() {
        let (worker, loads) = reference_worker();
        for envelope in [json!({}), json!({ "input": null }), json!({ "input": { "seed": 1 } })] {
            let failure = error_of(worker.handle(&envelope).await);
            assert_eq!(failure.kind, ErrorKind::Validation);
            assert!(failure.error.contains("panel_prompt"));
        }
        assert_eq!(loads.load(Ordering::SeqCst), 0);
        assert!(!worker.cache().is_loaded());
    }

    #[tokio::test]
    async fn malformed_envelope_is_an_error_envelope() {
        let (worker, _) = reference_worker();
        let failure = error_of(worker.handle(&json!([1, 2, 3])).await);
        assert_eq!(failure.kind, ErrorKind::Validation);
        let failure = error_of(worker.handle(&json!({ "input": "prompt" })).await);
        assert!(failure.error.contains("input"));

        let body = serde_json::to_value(JobOutput::Failure(failure)).unwrap();
        assert_eq!(body.as_object().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn corrupt_reference_only_fails_its_own_job() {
        let (worker, loads) = reference_worker();
        let failure = error_of(
            worker
                .handle(&json!({ "input": { "prompt": "x", "reference_image": "data:image/png;base64,@@@@" } }))
                .await,
        );
        assert_eq!(failure.kind, ErrorKind::Decode);

        let output = worker
            .handle(&json!({ "input": { "prompt": "x", "width": 64, "height": 64 } }))
            .await;
        assert!(!output.is_error());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn model_failure_is_reported_and_worker_keeps_serving() {
        let (worker, _) = reference_worker();
        let failure = error_of(
            worker
                .handle(&json!({ "input": { "prompt": "explode", "width": 64, "height": 64 } }))
                .await,
        );
        assert_eq!(failure.kind, ErrorKind::Model);
        assert!(failure.error.contains("CUDA out of memory"));

        let output = worker
            .handle(&json!({ "input": { "prompt": "calm", "width": 64, "height": 64 } }))
            .await;
        assert!(!output.is_error());
    }

    #[tokio::test]
    async fn failed_load_fails_the_job_then_recovers() {
        let loader = FakeLoader {
            fail_first: true,
            ..Default::default()
        };
        let worker = Worker::new(loader, LoadSettings::default());
        let envelope = json!({ "input": { "prompt": "x", "width": 64, "height": 64 } });

        let failure = error_of(worker.handle(&envelope).await);
        assert_eq!(failure.kind, ErrorKind::Model);
        assert!(!worker.handle(&envelope).await.is_error());
    }

    #[tokio::test]
    async fn same_seed_same_bytes() {
        let (worker, _) = reference_worker();
        let envelope = json!({ "input": { "prompt": "x", "seed": 1234, "width": 64, "height": 64 } });
        let first = success_of(worker.handle(&envelope).await);
        let second = success_of(worker.handle(&envelope).await);
        assert_eq!(first.image, second.image);
    }

    #[tokio::test]
    async fn abandoned_job_holds_the_pipeline_until_it_returns() {
        let (worker, _) = reference_worker();
        let model = worker.cache().ensure_loaded().await.unwrap();
        let slow = json!({ "input": { "prompt": "slow", "width": 64, "height": 64 } });

        let abandoned = tokio::time::timeout(Duration::from_millis(50), worker.handle(&slow)).await;
        assert!(abandoned.is_err());

        assert!(!worker.handle(&slow).await.is_error());
        // Let the abandoned call finish before checking the counters.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(model.unconditioned_calls.load(Ordering::SeqCst), 2);
        assert_eq!(model.max_in_flight.load(Ordering::SeqCst), 1);
    }
}
