use std::{sync::Arc, time::Instant};

use anyhow::Result;
use tokio::sync::OnceCell;
use tracing::info;

use crate::{LoadSettings, Loader};

/// Process-wide handle to the loaded pipeline.
///
/// The first caller of [`ModelCache::ensure_loaded`] runs the loader; concurrent callers wait
/// on the same initialisation instead of starting their own. A failed load leaves the cache
/// empty so the next job tries again. There is no unload.
pub struct ModelCache<L: Loader> {
    loader: L,
    settings: LoadSettings,
    model: OnceCell<Arc<L::Model>>,
}

impl<L: Loader> ModelCache<L> {
    pub fn new(loader: L, settings: LoadSettings) -> Self {
        Self {
            loader,
            settings,
            model: OnceCell::new(),
        }
    }

    pub fn settings(&self) -> &LoadSettings {
        &self.settings
    }

    pub fn is_loaded(&self) -> bool {
        self.model.initialized()
    }

    pub async fn ensure_loaded(&self) -> Result<Arc<L::Model>> {
        let model = self
            .model
            .get_or_try_init(|| async {
                info!(
                    variant = %self.settings.variant,
                    device_map = ?self.settings.device_map,
                    "loading pipeline"
                );
                let start = Instant::now();
                let model = self.loader.load(&self.settings).await?;
                info!(
                    elapsed_secs = start.elapsed().as_secs_f32(),
                    "pipeline loaded"
                );
                Ok::<_, anyhow::Error>(Arc::new(model))
            })
            .await?;
        Ok(model.clone())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use anyhow::bail;
    use image::{DynamicImage, Rgb, RgbImage};

    use super::*;
    use crate::{GenerationRequest, ModelLike, ReferenceImage};

    /// Paints a solid frame whose colour is derived from the seed and prompt length.
    /// Prompts containing "slow" hold the call for 200ms.
    #[derive(Debug, Default)]
    pub struct FakeModel {
        pub adapter: bool,
        pub unconditioned_calls: AtomicUsize,
        pub conditioned_calls: AtomicUsize,
        pub in_flight: AtomicUsize,
        /// Most calls ever seen running at once.
        pub max_in_flight: AtomicUsize,
    }

    impl FakeModel {
        fn occupy(&self, request: &GenerationRequest) {
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(running, Ordering::SeqCst);
            if request.prompt.contains("slow") {
                std::thread::sleep(Duration::from_millis(200));
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }

        fn paint(request: &GenerationRequest, tint: u8) -> DynamicImage {
            let seed = request.seed.unwrap_or_else(rand::random);
            let shade = (seed % 251) as u8;
            let len = (request.prompt.len() % 251) as u8;
            DynamicImage::ImageRgb8(RgbImage::from_pixel(
                request.width as u32,
                request.height as u32,
                Rgb([shade, len, tint]),
            ))
        }
    }

    impl ModelLike for FakeModel {
        fn run(&self, request: &GenerationRequest) -> Result<DynamicImage> {
            if request.prompt.contains("explode") {
                bail!("CUDA out of memory");
            }
            self.occupy(request);
            self.unconditioned_calls.fetch_add(1, Ordering::SeqCst);
            Ok(Self::paint(request, 0))
        }

        fn run_with_reference(
            &self,
            request: &GenerationRequest,
            reference: &ReferenceImage,
        ) -> Result<DynamicImage> {
            if !self.adapter {
                bail!("adapter not loaded");
            }
            self.occupy(request);
            self.conditioned_calls.fetch_add(1, Ordering::SeqCst);
            Ok(Self::paint(request, (reference.scale * 255.0) as u8))
        }

        fn supports_reference(&self) -> bool {
            self.adapter
        }
    }

    /// Counts how often it was asked to build a model.
    #[derive(Clone, Default)]
    pub struct FakeLoader {
        pub loads: Arc<AtomicUsize>,
        pub fail_first: bool,
    }

    impl Loader for FakeLoader {
        type Model = FakeModel;

        async fn load(&self, settings: &LoadSettings) -> Result<FakeModel> {
            let attempt = self.loads.fetch_add(1, Ordering::SeqCst);
            // Long enough for concurrent callers to pile up on the cell.
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.fail_first && attempt == 0 {
                bail!("failed to fetch unet weights");
            }
            Ok(FakeModel {
                adapter: settings.variant.loads_adapter(),
                ..Default::default()
            })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_requests_load_once() {
        let loader = FakeLoader::default();
        let loads = loader.loads.clone();
        let cache = Arc::new(ModelCache::new(loader, LoadSettings::default()));
        assert!(!cache.is_loaded());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.ensure_loaded().await.unwrap() })
            })
            .collect();
        let mut models = Vec::new();
        for handle in handles {
            models.push(handle.await.unwrap());
        }

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(cache.is_loaded());
        assert!(models.iter().all(|m| Arc::ptr_eq(m, &models[0])));
    }

    #[tokio::test]
    async fn later_calls_reuse_the_handle() {
        let loader = FakeLoader::default();
        let loads = loader.loads.clone();
        let cache = ModelCache::new(loader, LoadSettings::default());
        let first = cache.ensure_loaded().await.unwrap();
        let second = cache.ensure_loaded().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_load_is_retried() {
        let loader = FakeLoader {
            fail_first: true,
            ..Default::default()
        };
        let loads = loader.loads.clone();
        let cache = ModelCache::new(loader, LoadSettings::default());

        let err = cache.ensure_loaded().await.unwrap_err();
        assert!(err.to_string().contains("unet"));
        assert!(!cache.is_loaded());

        cache.ensure_loaded().await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }
}
