use crate::{
    context::{Handles, Slot},
    AcceleratorContext, CheckStatus, CudnnError, DataType, DeviceTensor, DropoutConfig,
    DropoutError, DropoutRuntime, MemoryManager, ScratchDecision, ScratchLayout, ScratchPlanner,
    ScratchRequirement, SeedSource, TensorLayout, ThreadSeeds,
};
use std::{
    error::Error,
    sync::atomic::{AtomicU64, Ordering},
};
use tracing::{debug, trace, warn};

static NEXT_HELPER_ID: AtomicU64 = AtomicU64::new(1);

/// Probability with which the primitive sets an element to zero.
///
/// Callers speak in retain probabilities. The conversion `p = 1 - retain` happens here and
/// nowhere else.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct DropProbability(f32);

impl DropProbability {
    pub fn from_retain(retain_probability: f64) -> Result<Self, DropoutError> {
        if !(0.0..=1.0).contains(&retain_probability) {
            return Err(DropoutError::InvalidProbability(retain_probability));
        }
        Ok(Self((1.0 - retain_probability) as f32))
    }

    pub fn get(self) -> f32 {
        self.0
    }
}

/// Proof that a forward pass ran, required by [`DropoutHelper::backward`].
///
/// The mask of a forward pass lives in the helper's scratch state until the next forward pass
/// overwrites it, so a session is only accepted by the helper that issued it and only until
/// that helper runs forward again.
#[derive(Debug, Clone, PartialEq)]
pub struct DropoutSession {
    helper: u64,
    generation: u64,
    shape: Vec<usize>,
    dropout: DropProbability,
}

impl DropoutSession {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Shape of the forward input. Gradients passed to backward must have this shape.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dropout(&self) -> DropProbability {
        self.dropout
    }
}

struct ScratchBuffer<R: DropoutRuntime> {
    raw: R::Scratch,
    layout: ScratchLayout,
}

/// Runs dropout forward and backward passes through an accelerator runtime.
///
/// The helper owns the [`AcceleratorContext`] and the scratch buffer; tensor memory is only
/// borrowed through the [`MemoryManager`], which is asked for device addresses and a stream on
/// every call.
///
/// Not synchronized internally. Sharing one helper between threads requires external locking.
///
/// # Examples
///
/// ```ignore
/// let mut helper = DropoutHelper::new(runtime, memory, DropoutConfig::default())?;
/// let session = helper.forward(&input, &mut output, 0.8)?;
/// // ...
/// helper.backward(&session, &grad_output, &mut grad_input)?;
/// ```
pub struct DropoutHelper<R, M, S = ThreadSeeds>
where
    R: DropoutRuntime,
    M: MemoryManager<R>,
    S: SeedSource,
{
    id: u64,
    config: DropoutConfig,
    context: AcceleratorContext<R>,
    memory: M,
    seeds: S,
    planner: ScratchPlanner,
    scratch: Option<ScratchBuffer<R>>,
    allocations: u64,
    generation: u64,
    last: Option<DropoutSession>,
}

impl<R, M> DropoutHelper<R, M, ThreadSeeds>
where
    R: DropoutRuntime,
    M: MemoryManager<R>,
{
    /// Creates the runtime context. Seeds come from the thread-local generator.
    pub fn new(runtime: R, memory: M, config: DropoutConfig) -> Result<Self, DropoutError> {
        Self::with_seeds(runtime, memory, ThreadSeeds, config)
    }
}

impl<R, M, S> DropoutHelper<R, M, S>
where
    R: DropoutRuntime,
    M: MemoryManager<R>,
    S: SeedSource,
{
    pub fn with_seeds(
        runtime: R,
        memory: M,
        seeds: S,
        config: DropoutConfig,
    ) -> Result<Self, DropoutError> {
        let context = AcceleratorContext::new(runtime)?;
        Ok(Self::from_context(context, memory, seeds, config))
    }

    fn from_context(
        context: AcceleratorContext<R>,
        memory: M,
        seeds: S,
        config: DropoutConfig,
    ) -> Self {
        Self {
            id: NEXT_HELPER_ID.fetch_add(1, Ordering::Relaxed),
            planner: ScratchPlanner::new(config.scratch),
            config,
            context,
            memory,
            seeds,
            scratch: None,
            allocations: 0,
            generation: 0,
            last: None,
        }
    }

    /// Applies dropout to `input`, writing the result to `output`.
    ///
    /// Every element is kept with `retain_probability` and scaled by its inverse, or set to
    /// zero. A fresh seed is installed on every call, so consecutive calls draw different masks.
    /// The returned session unlocks the matching [`backward`](Self::backward) call.
    pub fn forward(
        &mut self,
        input: &M::Tensor,
        output: &mut M::Tensor,
        retain_probability: f64,
    ) -> Result<DropoutSession, DropoutError> {
        self.ensure_live()?;
        let dropout = DropProbability::from_retain(retain_probability)?;
        check_same_shape("dropout output", input.shape(), output.shape())?;
        let x_layout = TensorLayout::of(input)?;
        let y_layout = TensorLayout::of(output)?;
        let data_type = <<M::Tensor as DeviceTensor>::Elem as DataType>::KIND;

        // the previous mask is gone as soon as the scratch state is touched
        self.generation += 1;
        self.last = None;

        let binding = self.memory.resolve(input, output).map_err(memory_error)?;
        let (runtime, handles) = self.context.split()?;
        // installing the configuration launches the state initialization on the bound stream
        runtime
            .set_stream(&mut handles.handle, binding.stream)
            .check("cudnnSetStream")?;

        handles
            .tensor_mut(Slot::X)
            .describe(runtime, data_type, &x_layout)?;
        handles
            .tensor_mut(Slot::Y)
            .describe(runtime, data_type, &y_layout)?;

        let seed = self.seeds.next_seed();
        let layout = install_dropout(
            runtime,
            handles,
            &mut self.scratch,
            &mut self.planner,
            &mut self.allocations,
            dropout,
            seed,
        )?;
        let Some(scratch) = self.scratch.as_ref() else {
            return Err(DropoutError::runtime("cudaMalloc", CudnnError::AllocFailed));
        };
        let reserve = runtime.scratch_ptr(&scratch.raw, layout.reserve_offset);

        trace!(
            stream = ?binding.stream,
            dropout = dropout.get(),
            seed,
            elements = x_layout.len(),
            "dropout forward"
        );
        runtime
            .dropout_forward(
                &handles.handle,
                &handles.dropout_desc,
                &handles.tensor(Slot::X).raw,
                binding.src,
                &handles.tensor(Slot::Y).raw,
                binding.dst,
                reserve,
                layout.reserve_size,
            )
            .check("cudnnDropoutForward")?;

        self.memory
            .notify_completed(binding.stream, input, output)
            .map_err(memory_error)?;
        if self.config.debug_sync {
            runtime
                .synchronize(binding.stream)
                .check("cuStreamSynchronize")?;
        }

        let session = DropoutSession {
            helper: self.id,
            generation: self.generation,
            shape: input.shape().to_vec(),
            dropout,
        };
        self.last = Some(session.clone());
        Ok(session)
    }

    /// Propagates `grad_output` back through the mask drawn by the forward pass of `session`,
    /// writing the result to `grad_input`.
    ///
    /// The dropout configuration installed by forward is reused as is.
    pub fn backward(
        &mut self,
        session: &DropoutSession,
        grad_output: &M::Tensor,
        grad_input: &mut M::Tensor,
    ) -> Result<(), DropoutError> {
        self.ensure_live()?;
        self.check_session(session)?;
        check_same_shape("gradient at input", grad_output.shape(), grad_input.shape())?;
        check_same_shape("gradient at output", session.shape(), grad_output.shape())?;
        let dy_layout = TensorLayout::of(grad_output)?;
        let dx_layout = TensorLayout::of(grad_input)?;
        let data_type = <<M::Tensor as DeviceTensor>::Elem as DataType>::KIND;

        let Some(scratch) = self.scratch.as_ref() else {
            return Err(DropoutError::NoPriorForward);
        };

        let binding = self
            .memory
            .resolve(grad_output, grad_input)
            .map_err(memory_error)?;
        let (runtime, handles) = self.context.split()?;
        runtime
            .set_stream(&mut handles.handle, binding.stream)
            .check("cudnnSetStream")?;

        handles
            .tensor_mut(Slot::Dy)
            .describe(runtime, data_type, &dy_layout)?;
        handles
            .tensor_mut(Slot::Dx)
            .describe(runtime, data_type, &dx_layout)?;

        let reserve = runtime.scratch_ptr(&scratch.raw, scratch.layout.reserve_offset);
        trace!(
            stream = ?binding.stream,
            generation = session.generation,
            elements = dy_layout.len(),
            "dropout backward"
        );
        runtime
            .dropout_backward(
                &handles.handle,
                &handles.dropout_desc,
                &handles.tensor(Slot::Dy).raw,
                binding.src,
                &handles.tensor(Slot::Dx).raw,
                binding.dst,
                reserve,
                scratch.layout.reserve_size,
            )
            .check("cudnnDropoutBackward")?;

        self.memory
            .notify_completed(binding.stream, grad_output, grad_input)
            .map_err(memory_error)?;
        if self.config.debug_sync {
            runtime
                .synchronize(binding.stream)
                .check("cuStreamSynchronize")?;
        }
        Ok(())
    }

    /// [`backward`](Self::backward) against the most recent forward pass.
    ///
    /// Fails with [`DropoutError::NoPriorForward`] if no forward pass completed yet.
    pub fn backward_last(
        &mut self,
        grad_output: &M::Tensor,
        grad_input: &mut M::Tensor,
    ) -> Result<(), DropoutError> {
        self.ensure_live()?;
        let session = self.last.clone().ok_or(DropoutError::NoPriorForward)?;
        self.backward(&session, grad_output, grad_input)
    }

    /// Releases the scratch buffer, then all descriptors and the handle.
    ///
    /// Every later call, including a second `dispose`, fails with [`DropoutError::Disposed`].
    /// Dropping the helper disposes it if this was not called.
    pub fn dispose(&mut self) -> Result<(), DropoutError> {
        self.ensure_live()?;
        self.last = None;

        let mut first = None;
        if let Some(scratch) = self.scratch.take() {
            if let Err(status) = self.context.runtime().free_scratch(scratch.raw) {
                first = Some(DropoutError::runtime("cudaFree", status));
            }
        }
        if let Err(err) = self.context.destroy() {
            first.get_or_insert(err);
        }

        debug!(helper = self.id, allocations = self.allocations, "disposed dropout helper");
        first.map_or(Ok(()), Err)
    }

    pub fn is_disposed(&self) -> bool {
        self.context.is_destroyed()
    }

    /// Capacity in bytes of the current scratch buffer, if one was allocated.
    pub fn scratch_capacity(&self) -> Option<usize> {
        self.scratch.as_ref().map(|s| s.layout.capacity())
    }

    /// How many times a scratch buffer was allocated over the helper's lifetime.
    pub fn scratch_allocations(&self) -> u64 {
        self.allocations
    }

    /// Session of the most recent successful forward pass.
    pub fn last_session(&self) -> Option<&DropoutSession> {
        self.last.as_ref()
    }

    pub fn runtime_version(&self) -> (u32, u32, u32) {
        self.context.runtime().version()
    }

    pub fn config(&self) -> &DropoutConfig {
        &self.config
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    fn ensure_live(&self) -> Result<(), DropoutError> {
        if self.is_disposed() {
            return Err(DropoutError::Disposed);
        }
        Ok(())
    }

    fn check_session(&self, session: &DropoutSession) -> Result<(), DropoutError> {
        let latest = self.last.as_ref().map(|s| s.generation);
        if session.helper != self.id || latest != Some(session.generation) {
            return Err(DropoutError::StaleSession {
                generation: session.generation,
                latest: self.generation,
            });
        }
        Ok(())
    }
}

impl<R, M, S> DropoutHelper<R, M, S>
where
    R: DropoutRuntime + Clone,
    M: MemoryManager<R> + Clone,
    S: SeedSource + Clone,
{
    /// Creates an independent helper with its own context, sharing configuration only.
    ///
    /// The clone starts without scratch state, session or dropout configuration, so its
    /// [`backward_last`](Self::backward_last) fails with [`DropoutError::NoPriorForward`] and
    /// sessions of the original are rejected until the clone has run its own forward pass.
    /// A cloned seed generator repeats the seeds of the original; use [`ThreadSeeds`] or reseed
    /// if that matters.
    pub fn try_clone(&self) -> Result<Self, DropoutError> {
        self.ensure_live()?;
        let context = self.context.try_clone()?;
        let mut clone = Self::from_context(
            context,
            self.memory.clone(),
            self.seeds.clone(),
            self.config.clone(),
        );
        clone.planner = self.planner.clone();
        Ok(clone)
    }
}

impl<R, M, S> Drop for DropoutHelper<R, M, S>
where
    R: DropoutRuntime,
    M: MemoryManager<R>,
    S: SeedSource,
{
    fn drop(&mut self) {
        if self.is_disposed() {
            return;
        }
        if let Err(err) = self.dispose() {
            warn!(%err, helper = self.id, "failed to dispose dropout helper");
        }
    }
}

/// Sizes the scratch buffer for the input currently described in `x` and installs the dropout
/// configuration with a fresh seed. Regrows and retries when the runtime rejects a states
/// region it reported as sufficient.
fn install_dropout<R: DropoutRuntime>(
    runtime: &R,
    handles: &mut Handles<R>,
    scratch: &mut Option<ScratchBuffer<R>>,
    planner: &mut ScratchPlanner,
    allocations: &mut u64,
    dropout: DropProbability,
    seed: u64,
) -> Result<ScratchLayout, DropoutError> {
    // re-queried on every call, the reserve size depends on the descriptor
    let req = ScratchRequirement {
        states: runtime
            .dropout_states_size(&handles.handle)
            .check("cudnnDropoutGetStatesSize")?,
        reserve: runtime
            .dropout_reserve_space_size(&handles.tensor(Slot::X).raw)
            .check("cudnnDropoutGetReserveSpaceSize")?,
    };

    let mut attempts = 0;
    loop {
        let capacity = scratch.as_ref().map(|s| s.layout.capacity());
        let states = match planner.plan(capacity, req) {
            ScratchDecision::Reuse(layout) => match scratch.as_mut() {
                Some(buffer) => {
                    buffer.layout = layout;
                    runtime.scratch_ptr(&buffer.raw, 0)
                }
                None => grow(runtime, scratch, allocations, layout)?,
            },
            ScratchDecision::Grow(layout) => grow(runtime, scratch, allocations, layout)?,
        };
        let Some(layout) = scratch.as_ref().map(|s| s.layout) else {
            return Err(DropoutError::runtime("cudaMalloc", CudnnError::AllocFailed));
        };

        match runtime.set_dropout_descriptor(
            &mut handles.dropout_desc,
            &handles.handle,
            dropout.get(),
            states,
            layout.states_size,
            seed,
        ) {
            Ok(()) => return Ok(layout),
            Err(CudnnError::InvalidValue) => {
                attempts += 1;
                if attempts > planner.policy().retry_limit {
                    return Err(DropoutError::ScratchTooSmall {
                        call: "cudnnSetDropoutDescriptor",
                        requested: layout.states_size,
                        reported: req.states,
                        attempts,
                    });
                }
                let margin = planner.escalate(req, layout);
                warn!(
                    requested = layout.states_size,
                    reported = req.states,
                    margin,
                    attempt = attempts,
                    "runtime rejected the dropout state size it reported, growing scratch"
                );
            }
            Err(status) => {
                return Err(DropoutError::runtime("cudnnSetDropoutDescriptor", status));
            }
        }
    }
}

/// Replaces the scratch buffer with one of `layout.capacity()` bytes and returns the address of
/// its states region. The old buffer is released first.
fn grow<R: DropoutRuntime>(
    runtime: &R,
    scratch: &mut Option<ScratchBuffer<R>>,
    allocations: &mut u64,
    layout: ScratchLayout,
) -> Result<R::DevicePtr, DropoutError> {
    let previous = scratch.as_ref().map(|s| s.layout.capacity());
    if let Some(old) = scratch.take() {
        runtime.free_scratch(old.raw).check("cudaFree")?;
    }

    let raw = runtime.alloc_scratch(layout.capacity()).check("cudaMalloc")?;
    *allocations += 1;
    debug!(
        previous = ?previous,
        capacity = layout.capacity(),
        states = layout.states_size,
        reserve = layout.reserve_size,
        "allocated dropout scratch"
    );

    let states = runtime.scratch_ptr(&raw, 0);
    *scratch = Some(ScratchBuffer { raw, layout });
    Ok(states)
}

fn check_same_shape(
    what: &'static str,
    left: &[usize],
    right: &[usize],
) -> Result<(), DropoutError> {
    if left != right {
        return Err(DropoutError::ShapeMismatch {
            what,
            left: left.to_vec(),
            right: right.to_vec(),
        });
    }
    Ok(())
}

fn memory_error<E: Error + Send + Sync + 'static>(err: E) -> DropoutError {
    DropoutError::Memory(Box::new(err))
}
