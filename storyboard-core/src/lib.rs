//! Request handling and model lifecycle for a serverless storyboard frame generator.
//!
//! A job envelope flows through [`JobParams::from_input`], [`prompt::compose`], the
//! [`ModelCache`] and [`invoker::generate`] before being encoded by [`codec`]. [`Worker`]
//! ties the steps together and turns every failure into an error envelope.

pub mod cache;
pub mod codec;
pub mod device_map;
pub mod error;
pub mod handler;
pub mod invoker;
pub mod loader;
pub mod prompt;
pub mod request;
mod sdxl;
mod util;

pub use cache::ModelCache;
pub use device_map::*;
pub use error::{ErrorKind, JobError, JobResult};
pub use handler::{JobFailure, JobOutput, JobSuccess, Worker};
pub use invoker::GenerationResult;
pub use loader::*;
pub use request::JobParams;
pub use sdxl::{SdxlLoader, SdxlModel, SdxlWeights};
pub(crate) use util::*;

use image::DynamicImage;

/// Sampling parameters handed to the diffusion pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub width: usize,
    pub height: usize,
    pub steps: usize,
    pub guidance: f64,
    pub seed: Option<u64>,
}

/// A decoded reference image and how strongly it should steer generation.
#[derive(Debug, Clone)]
pub struct ReferenceImage {
    pub image: DynamicImage,
    /// In `[0, 1]`.
    pub scale: f64,
}

/// The diffusion pipeline. Both calls return exactly one image.
pub trait ModelLike: Send + Sync {
    fn run(&self, request: &GenerationRequest) -> anyhow::Result<DynamicImage>;

    fn run_with_reference(
        &self,
        request: &GenerationRequest,
        reference: &ReferenceImage,
    ) -> anyhow::Result<DynamicImage>;

    /// Whether the reference adapter was loaded with this pipeline.
    fn supports_reference(&self) -> bool;
}
