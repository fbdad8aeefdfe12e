//! Accelerator device selection.

use candle_core::Device;
use tracing::{info, warn};

use crate::env::AcceleratorEnv;
use crate::error::Result;

/// Pick the device this process runs on.
///
/// `USE_CUDA=1` asks for CUDA ordinal `local_rank`; the request fails when
/// CUDA support is compiled in but the device cannot be opened. Without CUDA
/// support compiled in, the process falls back to Metal when available and
/// the host CPU otherwise.
pub fn select_device(env: &AcceleratorEnv, local_rank: usize) -> Result<Device> {
    if env.use_cuda {
        if candle_core::utils::cuda_is_available() {
            let device = Device::new_cuda(local_rank)?;
            info!("Using CUDA device {}", local_rank);
            return Ok(device);
        }
        warn!("USE_CUDA=1 but this build has no CUDA support, falling back");
    }

    if candle_core::utils::metal_is_available() {
        let device = Device::new_metal(local_rank)?;
        info!("Using Metal device {}", local_rank);
        return Ok(device);
    }

    Ok(Device::Cpu)
}

/// Number of devices a multi-process launch fans out to.
///
/// `GPU_NUM_DEVICES` wins when set, then the entries of
/// `CUDA_VISIBLE_DEVICES`; a single device otherwise.
pub fn visible_device_count(env: &AcceleratorEnv) -> usize {
    if env.gpu_num_devices > 0 {
        return env.gpu_num_devices;
    }
    if let Some(visible) = &env.cuda_visible_devices {
        let count = visible
            .split(',')
            .filter(|entry| !entry.trim().is_empty())
            .count();
        if count > 0 {
            return count;
        }
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_count_prefers_hint() {
        let env = AcceleratorEnv {
            gpu_num_devices: 8,
            cuda_visible_devices: Some("0,1".to_string()),
            ..Default::default()
        };
        assert_eq!(visible_device_count(&env), 8);
    }

    #[test]
    fn test_device_count_from_visible_devices() {
        let env = AcceleratorEnv {
            cuda_visible_devices: Some("0, 2,3".to_string()),
            ..Default::default()
        };
        assert_eq!(visible_device_count(&env), 3);
    }

    #[test]
    fn test_device_count_default() {
        assert_eq!(visible_device_count(&AcceleratorEnv::default()), 1);
    }

    #[test]
    fn test_cpu_selected_without_accelerators() {
        if candle_core::utils::metal_is_available() {
            return;
        }
        let device = select_device(&AcceleratorEnv::default(), 0).unwrap();
        assert!(device.is_cpu());
    }
}
