//! Dropout forward and backward passes delegated to cuDNN.
//!
//! [`DropoutHelper`] owns every native object the primitive needs (a library handle, four tensor
//! descriptors, a dropout descriptor and a scratch buffer) and releases them deterministically.
//! Tensor memory is borrowed through a [`MemoryManager`], which resolves device addresses and the
//! stream to run on for every call.
//!
//! The library surface is abstracted by [`DropoutRuntime`]. With the `cudnn` feature,
//! [`CudnnRuntime`] drives the real library.

mod config;
mod context;
mod data_type;
mod error;
mod helper;
mod memory;
mod runtime;
mod scratch;
mod seed;
mod tensor;

#[cfg(feature = "cudnn")]
mod cudnn;

pub use config::*;
pub use context::AcceleratorContext;
pub use data_type::*;
pub use error::*;
pub use helper::*;
pub use memory::*;
pub use runtime::*;
pub use scratch::*;
pub use seed::*;
pub use tensor::*;

#[cfg(feature = "cudnn")]
pub use cudnn::*;

pub(crate) mod private {
    pub trait Sealed {}
}
