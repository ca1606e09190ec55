use image::DynamicImage;
use tracing::info;

use crate::{
    codec, prompt, GenerationRequest, JobError, JobParams, JobResult, ModelLike, ReferenceImage,
};

/// One generated frame plus what produced it.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub image: DynamicImage,
    pub prompt_used: String,
    /// The job's seed as given.
    pub seed: Option<i64>,
}

/// Builds the sampling request for a job. Pure. Seeds keep their bit pattern, so a negative
/// seed becomes its two's-complement `u64`.
pub fn sampling_request(params: &JobParams) -> GenerationRequest {
    GenerationRequest {
        prompt: prompt::compose(
            &params.description,
            params.character.as_deref(),
            params.style.as_deref(),
        ),
        negative_prompt: params.negative_prompt().to_string(),
        width: params.width,
        height: params.height,
        steps: params.steps,
        guidance: params.guidance,
        seed: params.seed.map(|seed| seed as u64),
    }
}

/// Runs one job against a loaded pipeline, choosing the reference-conditioned path when the
/// job carries a reference image.
pub fn generate<M: ModelLike + ?Sized>(model: &M, params: &JobParams) -> JobResult<GenerationResult> {
    let request = sampling_request(params);

    info!(prompt = %request.prompt, seed = ?request.seed, "generating storyboard frame");

    let image = match params.reference_image.as_deref() {
        None => model.run(&request)?,
        Some(encoded) => {
            let reference = ReferenceImage {
                image: codec::base64_to_image(encoded)?,
                scale: params.adapter_scale,
            };
            if !model.supports_reference() {
                return Err(JobError::validation(
                    "'reference_image' is not supported by this worker; start it with the reference variant",
                ));
            }
            info!(adapter_scale = reference.scale, "conditioning on reference image");
            model.run_with_reference(&request, &reference)?
        }
    };

    info!("frame generated");

    Ok(GenerationResult {
        image,
        prompt_used: request.prompt,
        seed: params.seed,
    })
}
