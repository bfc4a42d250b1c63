use anyhow::{bail, Result};
use candle_core::{utils, DType, Device};

/// Where and how an engine is built
///
/// This is environment, not request data: the same context is normally reused
/// for every prompt a front end sends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineContext {
    /// Run on CPU rather than GPU
    pub cpu: bool,
    /// "f16", "bf16" or "f32"; None picks one per device
    pub dtype: Option<String>,
    pub use_flash_attn: bool,
}

impl EngineContext {
    pub fn device(&self) -> Result<Device> {
        if self.cpu {
            Ok(Device::Cpu)
        } else if utils::cuda_is_available() {
            Ok(Device::new_cuda(0)?)
        } else if utils::metal_is_available() {
            Ok(Device::new_metal(0)?)
        } else {
            Ok(Device::Cpu)
        }
    }

    pub fn dtype(&self, device: &Device) -> Result<DType> {
        let dtype = match self.dtype.as_deref() {
            Some("f16") => DType::F16,
            Some("bf16") => DType::BF16,
            Some("f32") => DType::F32,
            Some(dtype) => bail!("Unsupported dtype {dtype}"),
            None => {
                if device.is_cuda() {
                    DType::BF16
                } else if device.is_metal() {
                    DType::F16
                } else {
                    DType::F32
                }
            }
        };
        Ok(dtype)
    }
}
