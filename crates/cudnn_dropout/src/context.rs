use crate::{CheckStatus, CudnnError, DataKind, DropoutError, DropoutRuntime, TensorLayout};
use tracing::{debug, warn};

/// Tensor descriptor slots held by an [`AcceleratorContext`], in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Slot {
    /// Input.
    X = 0,
    /// Gradient at input.
    Dx = 1,
    /// Output.
    Y = 2,
    /// Gradient at output.
    Dy = 3,
}

const SLOTS: usize = 4;

/// A runtime tensor descriptor together with a host-side mirror of its last configuration.
pub(crate) struct TensorDescriptor<R: DropoutRuntime> {
    pub(crate) raw: R::TensorDesc,
    described: Option<(DataKind, TensorLayout)>,
}

impl<R: DropoutRuntime> TensorDescriptor<R> {
    fn new(raw: R::TensorDesc) -> Self {
        Self {
            raw,
            described: None,
        }
    }

    /// Re-describes the descriptor in place. No new runtime object is created.
    pub(crate) fn describe(
        &mut self,
        runtime: &R,
        data_type: DataKind,
        layout: &TensorLayout,
    ) -> Result<(), DropoutError> {
        runtime
            .set_tensor_descriptor(&mut self.raw, data_type, layout.shape(), layout.strides())
            .check("cudnnSetTensorNdDescriptor")?;
        self.described = Some((data_type, layout.clone()));
        Ok(())
    }
}

/// Native objects owned by a live context.
pub(crate) struct Handles<R: DropoutRuntime> {
    pub(crate) handle: R::Handle,
    pub(crate) dropout_desc: R::DropoutDesc,
    tensors: Vec<TensorDescriptor<R>>,
}

impl<R: DropoutRuntime> Handles<R> {
    pub(crate) fn tensor(&self, slot: Slot) -> &TensorDescriptor<R> {
        &self.tensors[slot as usize]
    }

    pub(crate) fn tensor_mut(&mut self, slot: Slot) -> &mut TensorDescriptor<R> {
        &mut self.tensors[slot as usize]
    }
}

/// The library handle plus the four tensor descriptors and the dropout descriptor a dropout
/// layer needs.
///
/// Everything is created in [`AcceleratorContext::new`] and released in [`destroy`] or on drop,
/// in the exact reverse order of creation: `dy`, `y`, `dx`, `x`, the dropout descriptor, then
/// the handle. A context is never copied; [`try_clone`] creates fresh runtime objects.
///
/// [`destroy`]: AcceleratorContext::destroy
/// [`try_clone`]: AcceleratorContext::try_clone
pub struct AcceleratorContext<R: DropoutRuntime> {
    runtime: R,
    handles: Option<Handles<R>>,
}

impl<R: DropoutRuntime> AcceleratorContext<R> {
    /// Creates the handle and all descriptors. If any creation fails, the objects created so far
    /// are released before the error is returned.
    pub fn new(runtime: R) -> Result<Self, DropoutError> {
        let handle = runtime.create_handle().check("cudnnCreate")?;

        match Self::create_descriptors(&runtime) {
            Ok((dropout_desc, tensors)) => {
                debug!(version = ?runtime.version(), "created dropout context");
                Ok(Self {
                    runtime,
                    handles: Some(Handles {
                        handle,
                        dropout_desc,
                        tensors,
                    }),
                })
            }
            Err(err) => {
                release(runtime.destroy_handle(handle), "cudnnDestroy");
                Err(err)
            }
        }
    }

    fn create_descriptors(
        runtime: &R,
    ) -> Result<(R::DropoutDesc, Vec<TensorDescriptor<R>>), DropoutError> {
        let dropout_desc = runtime
            .create_dropout_descriptor()
            .check("cudnnCreateDropoutDescriptor")?;

        let mut tensors = Vec::with_capacity(SLOTS);
        for _ in 0..SLOTS {
            match runtime
                .create_tensor_descriptor()
                .check("cudnnCreateTensorDescriptor")
            {
                Ok(raw) => tensors.push(TensorDescriptor::new(raw)),
                Err(err) => {
                    for desc in tensors.into_iter().rev() {
                        release(
                            runtime.destroy_tensor_descriptor(desc.raw),
                            "cudnnDestroyTensorDescriptor",
                        );
                    }
                    release(
                        runtime.destroy_dropout_descriptor(dropout_desc),
                        "cudnnDestroyDropoutDescriptor",
                    );
                    return Err(err);
                }
            }
        }

        Ok((dropout_desc, tensors))
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn is_destroyed(&self) -> bool {
        self.handles.is_none()
    }

    pub(crate) fn split(&mut self) -> Result<(&R, &mut Handles<R>), DropoutError> {
        match self.handles.as_mut() {
            Some(handles) => Ok((&self.runtime, handles)),
            None => Err(DropoutError::Disposed),
        }
    }

    /// Releases every native object. Later calls are no-ops.
    ///
    /// All objects are released even if one release fails; the first failure is returned.
    pub fn destroy(&mut self) -> Result<(), DropoutError> {
        let Some(mut handles) = self.handles.take() else {
            return Ok(());
        };

        let mut first = None;
        let mut note = |res: Result<(), CudnnError>, call: &'static str| {
            if let Err(status) = res {
                first.get_or_insert(DropoutError::runtime(call, status));
            }
        };

        while let Some(desc) = handles.tensors.pop() {
            note(
                self.runtime.destroy_tensor_descriptor(desc.raw),
                "cudnnDestroyTensorDescriptor",
            );
        }
        note(
            self.runtime.destroy_dropout_descriptor(handles.dropout_desc),
            "cudnnDestroyDropoutDescriptor",
        );
        note(self.runtime.destroy_handle(handles.handle), "cudnnDestroy");

        debug!("destroyed dropout context");
        first.map_or(Ok(()), Err)
    }
}

impl<R: DropoutRuntime + Clone> AcceleratorContext<R> {
    /// Creates an independent context whose tensor descriptors carry the same configuration.
    ///
    /// The dropout descriptor is left unconfigured in the clone: its configuration binds state
    /// memory owned by whoever installed it. A helper built on the clone cannot run backward
    /// until it has run a forward pass of its own.
    pub fn try_clone(&self) -> Result<Self, DropoutError> {
        let Some(handles) = self.handles.as_ref() else {
            return Err(DropoutError::Disposed);
        };

        let mut clone = Self::new(self.runtime.clone())?;
        let (runtime, cloned) = clone.split()?;
        for (src, dst) in handles.tensors.iter().zip(cloned.tensors.iter_mut()) {
            if let Some((data_type, layout)) = &src.described {
                dst.describe(runtime, *data_type, layout)?;
            }
        }
        Ok(clone)
    }
}

impl<R: DropoutRuntime> Drop for AcceleratorContext<R> {
    fn drop(&mut self) {
        if let Err(err) = self.destroy() {
            warn!(%err, "failed to release dropout context");
        }
    }
}

fn release(res: Result<(), CudnnError>, call: &'static str) {
    if let Err(status) = res {
        warn!(call, %status, "release after failed context creation");
    }
}
