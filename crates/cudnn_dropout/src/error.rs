use std::{error::Error, fmt::Display};

/// Status returned by a failing accelerator runtime call.
///
/// The cuDNN variants map one-to-one onto `cudnnStatus_t`. Failures of the underlying CUDA
/// driver (allocation, stream synchronization) are carried as [`CudnnError::Driver`] with the
/// raw `CUresult` code.
///
/// cuDNN [docs](https://docs.nvidia.com/deeplearning/cudnn/api/index.html#cudnnStatus_t)
/// may offer additional information about the API behavior.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CudnnError {
    /// The cuDNN library was not initialized properly.
    NotInitialized,
    /// Resource allocation failed inside the cuDNN library. This is usually caused by an internal
    /// `cudaMalloc()` failure.
    AllocFailed,
    /// An incorrect value or parameter was passed to the function.
    BadParam,
    /// An internal cuDNN operation failed.
    InternalError,
    /// A value passed to the function is out of range. For dropout this is what the library
    /// reports when the states buffer is smaller than it needs.
    InvalidValue,
    /// The function requires a feature absent from the current GPU device.
    ArchMismatch,
    /// An access to GPU memory space failed.
    MappingError,
    /// The GPU program failed to execute.
    ExecutionFailed,
    /// The functionality requested is not presently supported by cuDNN.
    NotSupported,
    /// The functionality requested requires some license and an error was detected when trying to
    /// check the current licensing.
    LicenseError,
    /// A runtime library required by cuDNN cannot be found in the predefined search paths.
    RuntimePrerequisiteMissing,
    /// Some tasks in the user stream are not completed.
    RuntimeInProgress,
    /// Numerical overflow occurred during the GPU kernel execution.
    RuntimeFpOverflow,
    VersionMismatch,
    /// The CUDA driver rejected a call, carrying the raw `CUresult`.
    Driver(u32),
}

impl CudnnError {
    /// Converts a raw `cudnnStatus_t` value. `0` (success) yields `None`, unknown codes are
    /// reported as [`CudnnError::InternalError`].
    pub fn from_raw(status: u32) -> Option<Self> {
        Some(match status {
            0 => return None,
            1 => CudnnError::NotInitialized,
            2 => CudnnError::AllocFailed,
            3 => CudnnError::BadParam,
            4 => CudnnError::InternalError,
            5 => CudnnError::InvalidValue,
            6 => CudnnError::ArchMismatch,
            7 => CudnnError::MappingError,
            8 => CudnnError::ExecutionFailed,
            9 => CudnnError::NotSupported,
            10 => CudnnError::LicenseError,
            11 => CudnnError::RuntimePrerequisiteMissing,
            12 => CudnnError::RuntimeInProgress,
            13 => CudnnError::RuntimeFpOverflow,
            14 => CudnnError::VersionMismatch,
            _ => CudnnError::InternalError,
        })
    }

    /// Converts the `CudnnError` into the corresponding raw status code. Driver errors return the
    /// driver code.
    pub fn into_raw(self) -> u32 {
        match self {
            CudnnError::NotInitialized => 1,
            CudnnError::AllocFailed => 2,
            CudnnError::BadParam => 3,
            CudnnError::InternalError => 4,
            CudnnError::InvalidValue => 5,
            CudnnError::ArchMismatch => 6,
            CudnnError::MappingError => 7,
            CudnnError::ExecutionFailed => 8,
            CudnnError::NotSupported => 9,
            CudnnError::LicenseError => 10,
            CudnnError::RuntimePrerequisiteMissing => 11,
            CudnnError::RuntimeInProgress => 12,
            CudnnError::RuntimeFpOverflow => 13,
            CudnnError::VersionMismatch => 14,
            CudnnError::Driver(code) => code,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            CudnnError::NotInitialized => "CUDNN_STATUS_NOT_INITIALIZED",
            CudnnError::AllocFailed => "CUDNN_STATUS_ALLOC_FAILED",
            CudnnError::BadParam => "CUDNN_STATUS_BAD_PARAM",
            CudnnError::InternalError => "CUDNN_STATUS_INTERNAL_ERROR",
            CudnnError::InvalidValue => "CUDNN_STATUS_INVALID_VALUE",
            CudnnError::ArchMismatch => "CUDNN_STATUS_ARCH_MISMATCH",
            CudnnError::MappingError => "CUDNN_STATUS_MAPPING_ERROR",
            CudnnError::ExecutionFailed => "CUDNN_STATUS_EXECUTION_FAILED",
            CudnnError::NotSupported => "CUDNN_STATUS_NOT_SUPPORTED",
            CudnnError::LicenseError => "CUDNN_STATUS_LICENSE_ERROR",
            CudnnError::RuntimePrerequisiteMissing => "CUDNN_STATUS_RUNTIME_PREREQUISITE_MISSING",
            CudnnError::RuntimeInProgress => "CUDNN_STATUS_RUNTIME_IN_PROGRESS",
            CudnnError::RuntimeFpOverflow => "CUDNN_STATUS_RUNTIME_FP_OVERFLOW",
            CudnnError::VersionMismatch => "CUDNN_STATUS_VERSION_MISMATCH",
            CudnnError::Driver(_) => "CUDA_ERROR",
        }
    }
}

impl Display for CudnnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.into_raw())
    }
}

impl Error for CudnnError {}

/// Errors surfaced by [`DropoutHelper`](crate::DropoutHelper).
///
/// None of these are recovered inside the helper. The owning layer is expected to abort the
/// current training step when it sees one.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum DropoutError {
    /// A native runtime call returned a non-success status.
    #[error("{call} failed: {status}")]
    Runtime {
        call: &'static str,
        status: CudnnError,
    },

    /// The runtime-reported scratch size proved insufficient when the dropout configuration was
    /// installed, even after growing the buffer. Usually a runtime/version mismatch rather than
    /// caller misuse.
    #[error(
        "{call} rejected a {requested} byte state buffer although the runtime reported {reported} \
         bytes as sufficient ({attempts} attempts)"
    )]
    ScratchTooSmall {
        call: &'static str,
        requested: usize,
        reported: usize,
        attempts: u32,
    },

    /// `backward` was requested before any `forward` ran on this helper.
    #[error("dropout backward called with no prior forward pass")]
    NoPriorForward,

    /// The session does not describe the most recent forward pass of this helper.
    #[error("dropout session {generation} is stale, latest forward is {latest}")]
    StaleSession { generation: u64, latest: u64 },

    /// The helper already released its native resources.
    #[error("dropout helper used after dispose")]
    Disposed,

    #[error("{what}: shape {left:?} does not match {right:?}")]
    ShapeMismatch {
        what: &'static str,
        left: Vec<usize>,
        right: Vec<usize>,
    },

    #[error("retain probability must lie in [0, 1], got {0}")]
    InvalidProbability(f64),

    #[error("tensor rank {rank} exceeds the supported maximum of {max}")]
    RankTooLarge { rank: usize, max: usize },

    #[error("tensor extent {0} does not fit the runtime's 32-bit descriptor fields")]
    DimensionOverflow(usize),

    /// The external memory manager could not resolve or release the tensors.
    #[error("memory manager failure")]
    Memory(#[source] Box<dyn Error + Send + Sync>),
}

impl DropoutError {
    pub(crate) fn runtime(call: &'static str, status: CudnnError) -> Self {
        DropoutError::Runtime { call, status }
    }

    /// Whether the error stems from calling the helper incorrectly, as opposed to a runtime or
    /// sizing failure. Misuse is always detected before any native call is issued.
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            DropoutError::NoPriorForward
                | DropoutError::StaleSession { .. }
                | DropoutError::Disposed
                | DropoutError::ShapeMismatch { .. }
                | DropoutError::InvalidProbability(_)
                | DropoutError::RankTooLarge { .. }
                | DropoutError::DimensionOverflow(_)
        )
    }

    /// The runtime status, if this error came from a native call.
    pub fn status(&self) -> Option<CudnnError> {
        match self {
            DropoutError::Runtime { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Attaches the name of the native call to a runtime status.
pub trait CheckStatus<T> {
    fn check(self, call: &'static str) -> Result<T, DropoutError>;
}

impl<T> CheckStatus<T> for Result<T, CudnnError> {
    fn check(self, call: &'static str) -> Result<T, DropoutError> {
        self.map_err(|status| DropoutError::runtime(call, status))
    }
}
