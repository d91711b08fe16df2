use crate::{DeviceTensor, DropoutRuntime};
use std::error::Error;

/// Device addresses of a source/destination tensor pair and the stream work on them must be
/// enqueued on.
#[derive(Debug, Clone, Copy)]
pub struct Binding<P, S> {
    pub src: P,
    pub dst: P,
    pub stream: S,
}

/// The host-side tracker that knows where each tensor currently lives and which stream last
/// touched it.
///
/// The helper re-resolves on every call. A tensor may move, or be claimed by another stream,
/// between two calls, so neither addresses nor streams are cached.
pub trait MemoryManager<R: DropoutRuntime> {
    type Tensor: DeviceTensor;
    type Error: Error + Send + Sync + 'static;

    /// Makes `src` readable and `dst` writable on the device and picks the stream to run on.
    fn resolve(
        &self,
        src: &Self::Tensor,
        dst: &mut Self::Tensor,
    ) -> Result<Binding<R::DevicePtr, R::Stream>, Self::Error>;

    /// Records that work touching `src` and `dst` was enqueued on `stream`.
    fn notify_completed(
        &self,
        stream: R::Stream,
        src: &Self::Tensor,
        dst: &Self::Tensor,
    ) -> Result<(), Self::Error>;
}
