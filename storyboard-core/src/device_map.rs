use candle_core::{DType, Device};

/// Which device the pipeline is bound to. Read once at process start.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

impl DeviceMap {
    pub fn from_cpu_flag(cpu: bool) -> Self {
        if cpu {
            Self::ForceCpu
        } else {
            Self::default()
        }
    }
}

/// Numeric precision the weights are loaded in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Precision {
    Half,
    Full,
}

impl Precision {
    /// Half precision on accelerators, full precision on the CPU.
    pub fn for_device(device: &Device) -> Self {
        if device.is_cpu() {
            Self::Full
        } else {
            Self::Half
        }
    }

    pub fn dtype(self) -> DType {
        match self {
            Self::Half => DType::F16,
            Self::Full => DType::F32,
        }
    }

    /// Suffix of the weight files published for this precision, e.g. `model.fp16.safetensors`.
    pub fn weight_suffix(self) -> &'static str {
        match self {
            Self::Half => ".fp16",
            Self::Full => "",
        }
    }
}
