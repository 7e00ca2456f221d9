use serde::{Deserialize, Serialize};

/// Compute backend a pipeline is placed on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeBackend {
    Cpu,
    Cuda,
    Metal,
}

serde_plain::derive_display_from_serialize!(ComputeBackend);
serde_plain::derive_fromstr_from_deserialize!(ComputeBackend);

impl Default for ComputeBackend {
    fn default() -> Self {
        Self::Cpu
    }
}

impl ComputeBackend {
    pub fn is_accelerator(self) -> bool {
        !matches!(self, ComputeBackend::Cpu)
    }
}

/// Numeric precision the engine runs at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precision {
    #[serde(rename = "fp32")]
    Full,
    #[serde(rename = "fp16")]
    Half,
}

serde_plain::derive_display_from_serialize!(Precision);
serde_plain::derive_fromstr_from_deserialize!(Precision);

impl Default for Precision {
    fn default() -> Self {
        Self::Full
    }
}

impl Precision {
    /// Effective precision for a backend. Metal runs the whole pipeline at
    /// full precision; mixing dtypes there produces channel-mismatch
    /// artifacts in the decoder.
    pub fn resolve(self, backend: ComputeBackend) -> Precision {
        match backend {
            ComputeBackend::Metal => Precision::Full,
            _ => self,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metal_forces_full_precision() {
        assert_eq!(Precision::Half.resolve(ComputeBackend::Metal), Precision::Full);
        assert_eq!(Precision::Half.resolve(ComputeBackend::Cuda), Precision::Half);
        assert_eq!(Precision::Full.resolve(ComputeBackend::Cpu), Precision::Full);
    }

    #[test]
    fn backend_parses_from_str() {
        assert_eq!("cuda".parse::<ComputeBackend>().unwrap(), ComputeBackend::Cuda);
        assert_eq!("fp16".parse::<Precision>().unwrap(), Precision::Half);
        assert!("tpu".parse::<ComputeBackend>().is_err());
    }
}
