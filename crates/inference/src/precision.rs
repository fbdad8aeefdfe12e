//! Default tensor precision of the process.
//!
//! Model construction switches the process default to a reduced precision
//! and must hand it back untouched. [`PrecisionGuard`] does the switch and
//! restores the previous value when dropped, so early returns and errors
//! cannot leak the override.

use candle_core::DType;
use mpllama_core::AcceleratorEnv;
use parking_lot::{const_mutex, Mutex};
use tracing::debug;

/// Full precision, the process default outside of model construction.
pub const DEFAULT_PRECISION: DType = DType::F32;

static CURRENT: Mutex<DType> = const_mutex(DEFAULT_PRECISION);

/// Precision currently in effect for new allocations.
pub fn default_precision() -> DType {
    *CURRENT.lock()
}

/// Half precision on CUDA devices, bfloat16 on everything else.
pub fn select_precision(env: &AcceleratorEnv) -> DType {
    if env.use_cuda {
        DType::F16
    } else {
        DType::BF16
    }
}

/// Parse a `--precision` value.
pub fn parse_precision(name: &str) -> Option<DType> {
    match name.to_ascii_lowercase().as_str() {
        "f32" | "fp32" | "float32" => Some(DType::F32),
        "f16" | "fp16" | "half" | "float16" => Some(DType::F16),
        "bf16" | "bfloat16" => Some(DType::BF16),
        _ => None,
    }
}

/// Scoped override of the process default precision.
#[must_use = "the override ends when the guard is dropped"]
#[derive(Debug)]
pub struct PrecisionGuard {
    dtype: DType,
    previous: DType,
}

impl PrecisionGuard {
    pub fn acquire(dtype: DType) -> Self {
        let previous = std::mem::replace(&mut *CURRENT.lock(), dtype);
        debug!("Default precision {:?} -> {:?}", previous, dtype);
        Self { dtype, previous }
    }

    /// The precision new allocations must use while the guard lives.
    pub fn dtype(&self) -> DType {
        self.dtype
    }
}

impl Drop for PrecisionGuard {
    fn drop(&mut self) {
        *CURRENT.lock() = self.previous;
        debug!("Default precision restored to {:?}", self.previous);
    }
}

/// Serialises tests that observe the process-wide precision.
#[cfg(test)]
pub(crate) static TEST_LOCK: Mutex<()> = const_mutex(());
