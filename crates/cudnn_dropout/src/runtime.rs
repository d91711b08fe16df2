use crate::{CudnnError, DataKind};
use std::fmt::Debug;

/// The accelerator library surface the dropout helper drives.
///
/// Each method corresponds to one native call and reports the native status unchanged. The
/// helper attaches call names, orders the calls and owns every object created here; an
/// implementation only has to forward to the library. [`CudnnRuntime`](crate::CudnnRuntime) is
/// the cuDNN implementation.
///
/// Objects are returned by value and handed back to the matching `destroy_*`/`free_*` call
/// exactly once.
pub trait DropoutRuntime {
    /// Library handle (`cudnnHandle_t`).
    type Handle;
    /// Tensor descriptor (`cudnnTensorDescriptor_t`).
    type TensorDesc;
    /// Dropout descriptor (`cudnnDropoutDescriptor_t`).
    type DropoutDesc;
    /// Owned device allocation used for RNG states and the reserve space.
    type Scratch;
    /// Raw device address.
    type DevicePtr: Copy + Debug;
    /// Compute stream handle, as handed out by the memory manager.
    type Stream: Copy + Debug;

    fn create_handle(&self) -> Result<Self::Handle, CudnnError>;

    fn destroy_handle(&self, handle: Self::Handle) -> Result<(), CudnnError>;

    /// Library version as `(major, minor, patch)`.
    fn version(&self) -> (u32, u32, u32);

    fn create_tensor_descriptor(&self) -> Result<Self::TensorDesc, CudnnError>;

    /// Overwrites the configuration of `desc` in place.
    fn set_tensor_descriptor(
        &self,
        desc: &mut Self::TensorDesc,
        data_type: DataKind,
        shape: &[i32],
        strides: &[i32],
    ) -> Result<(), CudnnError>;

    fn destroy_tensor_descriptor(&self, desc: Self::TensorDesc) -> Result<(), CudnnError>;

    fn create_dropout_descriptor(&self) -> Result<Self::DropoutDesc, CudnnError>;

    fn destroy_dropout_descriptor(&self, desc: Self::DropoutDesc) -> Result<(), CudnnError>;

    /// Bytes needed for the random number generator states (`cudnnDropoutGetStatesSize`).
    fn dropout_states_size(&self, handle: &Self::Handle) -> Result<usize, CudnnError>;

    /// Bytes of reserve space needed for an input described by `x_desc`
    /// (`cudnnDropoutGetReserveSpaceSize`).
    fn dropout_reserve_space_size(&self, x_desc: &Self::TensorDesc) -> Result<usize, CudnnError>;

    /// Binds probability, state memory and seed to `desc` and initializes the RNG states
    /// (`cudnnSetDropoutDescriptor`).
    #[allow(clippy::too_many_arguments)]
    fn set_dropout_descriptor(
        &self,
        desc: &mut Self::DropoutDesc,
        handle: &Self::Handle,
        dropout: f32,
        states: Self::DevicePtr,
        states_size: usize,
        seed: u64,
    ) -> Result<(), CudnnError>;

    fn alloc_scratch(&self, bytes: usize) -> Result<Self::Scratch, CudnnError>;

    fn free_scratch(&self, scratch: Self::Scratch) -> Result<(), CudnnError>;

    /// Device address `offset` bytes into `scratch`.
    fn scratch_ptr(&self, scratch: &Self::Scratch, offset: usize) -> Self::DevicePtr;

    /// Binds the stream subsequent kernels of `handle` are enqueued on.
    fn set_stream(&self, handle: &mut Self::Handle, stream: Self::Stream) -> Result<(), CudnnError>;

    #[allow(clippy::too_many_arguments)]
    fn dropout_forward(
        &self,
        handle: &Self::Handle,
        dropout_desc: &Self::DropoutDesc,
        x_desc: &Self::TensorDesc,
        x: Self::DevicePtr,
        y_desc: &Self::TensorDesc,
        y: Self::DevicePtr,
        reserve_space: Self::DevicePtr,
        reserve_space_size: usize,
    ) -> Result<(), CudnnError>;

    #[allow(clippy::too_many_arguments)]
    fn dropout_backward(
        &self,
        handle: &Self::Handle,
        dropout_desc: &Self::DropoutDesc,
        dy_desc: &Self::TensorDesc,
        dy: Self::DevicePtr,
        dx_desc: &Self::TensorDesc,
        dx: Self::DevicePtr,
        reserve_space: Self::DevicePtr,
        reserve_space_size: usize,
    ) -> Result<(), CudnnError>;

    /// Blocks the calling thread until `stream` drains.
    fn synchronize(&self, stream: Self::Stream) -> Result<(), CudnnError>;
}
