use std::{future::Future, path::PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::{DeviceMap, ModelLike};

/// The two flavours of worker: plain text-to-image, or text-to-image that can also be
/// steered by a reference image.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerVariant {
    #[default]
    Text,
    Reference,
}

serde_plain::derive_fromstr_from_deserialize!(HandlerVariant);
serde_plain::derive_display_from_serialize!(HandlerVariant);

impl HandlerVariant {
    pub fn loads_adapter(self) -> bool {
        matches!(self, Self::Reference)
    }
}

/// Everything a loader needs to build a pipeline.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LoadSettings {
    pub device_map: DeviceMap,
    pub variant: HandlerVariant,
    /// Where model artifacts are cached. `None` uses the hub's default location.
    pub cache_dir: Option<PathBuf>,
    /// Attention slice size for the UNet and VAE. `None` runs attention in one pass.
    pub sliced_attention_size: Option<usize>,
}

pub trait Loader: Send + Sync + 'static {
    type Model: ModelLike + 'static;

    fn load(&self, settings: &LoadSettings) -> impl Future<Output = Result<Self::Model>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_parses_from_plain_strings() {
        assert_eq!("text".parse::<HandlerVariant>().unwrap(), HandlerVariant::Text);
        assert_eq!(
            "reference".parse::<HandlerVariant>().unwrap(),
            HandlerVariant::Reference
        );
        assert!("adapter".parse::<HandlerVariant>().is_err());
        assert_eq!(HandlerVariant::Reference.to_string(), "reference");
    }

    #[test]
    fn only_reference_variant_loads_adapter() {
        assert!(!HandlerVariant::Text.loads_adapter());
        assert!(HandlerVariant::Reference.loads_adapter());
    }
}
