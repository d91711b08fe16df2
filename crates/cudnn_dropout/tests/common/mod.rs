//! Host-emulated runtime and memory manager for driving `DropoutHelper` without a GPU.
//!
//! The emulated device records every native call, checks object lifetimes and buffer sizes the
//! way cuDNN does, and draws dropout masks from a `StdRng` seeded by the installed seed.

#![allow(dead_code)]

use cudnn_dropout::{
    Binding, CudnnError, DataKind, DeviceTensor, DropoutRuntime, MemoryManager, SeedSource,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    cell::RefCell,
    collections::{HashMap, HashSet, VecDeque},
    rc::Rc,
};

pub const STATES_SIZE: usize = 4096;
pub const DEFAULT_STREAM: u64 = 7;

struct DropoutState {
    dropout: f32,
    rng: StdRng,
}

#[derive(Default)]
pub struct Device {
    next_id: u64,
    /// Native calls in issue order, with the object they touched.
    pub calls: Vec<(&'static str, u64)>,
    live: HashSet<u64>,
    tensor_descs: HashMap<u64, (Vec<i32>, Vec<i32>)>,
    dropout_descs: HashMap<u64, Option<DropoutState>>,
    allocations: HashMap<u64, usize>,
    masks: HashMap<u64, Vec<bool>>,
    buffers: HashMap<u64, Vec<f32>>,
    /// Extra state bytes the device silently needs beyond the size it reports.
    pub hidden_states_need: usize,
    /// Name and 1-based occurrence of a call that should fail with `InternalError`.
    pub fail_on: Option<(&'static str, usize)>,
    pub stream: u64,
    pub bound_stream: Option<u64>,
    /// Stream bound to the handle at every dropout configuration install.
    pub install_streams: Vec<Option<u64>>,
    pub seeds: Vec<u64>,
    pub fail_resolve: bool,
}

impl Device {
    fn id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id << 20
    }

    fn call(&mut self, name: &'static str, object: u64) -> Result<(), CudnnError> {
        self.calls.push((name, object));
        if let Some((fail, nth)) = self.fail_on {
            let seen = self.calls.iter().filter(|(n, _)| *n == fail).count();
            if fail == name && seen == nth {
                return Err(CudnnError::InternalError);
            }
        }
        Ok(())
    }

    pub fn count(&self, name: &str) -> usize {
        self.calls.iter().filter(|(n, _)| *n == name).count()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.calls.iter().map(|(n, _)| *n).collect()
    }

    pub fn live_objects(&self) -> usize {
        self.live.len()
    }

    pub fn live_allocations(&self) -> usize {
        self.allocations.len()
    }

    fn release(&mut self, name: &'static str, object: u64) -> Result<(), CudnnError> {
        self.call(name, object)?;
        if !self.live.remove(&object) {
            return Err(CudnnError::BadParam);
        }
        Ok(())
    }

    fn elements(&self, desc: u64) -> Result<usize, CudnnError> {
        let (shape, _) = self.tensor_descs.get(&desc).ok_or(CudnnError::BadParam)?;
        Ok(shape.iter().map(|&d| d as usize).product())
    }

    /// Whether `[ptr, ptr + len)` lies inside one live allocation.
    fn covered(&self, ptr: u64, len: usize) -> bool {
        self.allocations
            .iter()
            .any(|(&base, &size)| ptr >= base && ptr + len as u64 <= base + size as u64)
    }
}

#[derive(Clone, Default)]
pub struct FakeRuntime {
    pub device: Rc<RefCell<Device>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        let runtime = Self::default();
        runtime.device.borrow_mut().stream = DEFAULT_STREAM;
        runtime
    }

    pub fn memory(&self) -> FakeMemory {
        FakeMemory {
            device: Rc::clone(&self.device),
        }
    }

    pub fn tensor(&self, shape: &[usize], data: &[f32]) -> FakeTensor {
        assert_eq!(shape.iter().product::<usize>(), data.len());
        let mut device = self.device.borrow_mut();
        let ptr = device.id();
        device.buffers.insert(ptr, data.to_vec());
        FakeTensor {
            ptr,
            shape: shape.to_vec(),
            strides: contiguous_strides(shape),
        }
    }

    pub fn zeros(&self, shape: &[usize]) -> FakeTensor {
        let len = shape.iter().product();
        self.tensor(shape, &vec![0.0; len])
    }

    pub fn read(&self, tensor: &FakeTensor) -> Vec<f32> {
        self.device.borrow().buffers[&tensor.ptr].clone()
    }

    pub fn with<T>(&self, f: impl FnOnce(&mut Device) -> T) -> T {
        f(&mut self.device.borrow_mut())
    }
}

pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

#[derive(Debug)]
pub struct FakeScratch {
    ptr: u64,
    len: usize,
}

impl DropoutRuntime for FakeRuntime {
    type Handle = u64;
    type TensorDesc = u64;
    type DropoutDesc = u64;
    type Scratch = FakeScratch;
    type DevicePtr = u64;
    type Stream = u64;

    fn create_handle(&self) -> Result<u64, CudnnError> {
        let mut d = self.device.borrow_mut();
        let id = d.id();
        d.call("cudnnCreate", id)?;
        d.live.insert(id);
        Ok(id)
    }

    fn destroy_handle(&self, handle: u64) -> Result<(), CudnnError> {
        self.device.borrow_mut().release("cudnnDestroy", handle)
    }

    fn version(&self) -> (u32, u32, u32) {
        (8, 9, 7)
    }

    fn create_tensor_descriptor(&self) -> Result<u64, CudnnError> {
        let mut d = self.device.borrow_mut();
        let id = d.id();
        d.call("cudnnCreateTensorDescriptor", id)?;
        d.live.insert(id);
        Ok(id)
    }

    fn set_tensor_descriptor(
        &self,
        desc: &mut u64,
        data_type: DataKind,
        shape: &[i32],
        strides: &[i32],
    ) -> Result<(), CudnnError> {
        let mut d = self.device.borrow_mut();
        d.call("cudnnSetTensorNdDescriptor", *desc)?;
        if !d.live.contains(desc) || data_type != DataKind::Float || shape.len() < 4 {
            return Err(CudnnError::BadParam);
        }
        d.tensor_descs
            .insert(*desc, (shape.to_vec(), strides.to_vec()));
        Ok(())
    }

    fn destroy_tensor_descriptor(&self, desc: u64) -> Result<(), CudnnError> {
        let mut d = self.device.borrow_mut();
        d.tensor_descs.remove(&desc);
        d.release("cudnnDestroyTensorDescriptor", desc)
    }

    fn create_dropout_descriptor(&self) -> Result<u64, CudnnError> {
        let mut d = self.device.borrow_mut();
        let id = d.id();
        d.call("cudnnCreateDropoutDescriptor", id)?;
        d.live.insert(id);
        d.dropout_descs.insert(id, None);
        Ok(id)
    }

    fn destroy_dropout_descriptor(&self, desc: u64) -> Result<(), CudnnError> {
        let mut d = self.device.borrow_mut();
        d.dropout_descs.remove(&desc);
        d.release("cudnnDestroyDropoutDescriptor", desc)
    }

    fn dropout_states_size(&self, handle: &u64) -> Result<usize, CudnnError> {
        let mut d = self.device.borrow_mut();
        d.call("cudnnDropoutGetStatesSize", *handle)?;
        Ok(STATES_SIZE)
    }

    fn dropout_reserve_space_size(&self, x_desc: &u64) -> Result<usize, CudnnError> {
        let mut d = self.device.borrow_mut();
        d.call("cudnnDropoutGetReserveSpaceSize", *x_desc)?;
        d.elements(*x_desc)
    }

    fn set_dropout_descriptor(
        &self,
        desc: &mut u64,
        handle: &u64,
        dropout: f32,
        states: u64,
        states_size: usize,
        seed: u64,
    ) -> Result<(), CudnnError> {
        let mut d = self.device.borrow_mut();
        d.call("cudnnSetDropoutDescriptor", *desc)?;
        let bound = d.bound_stream;
        d.install_streams.push(bound);
        if !d.live.contains(desc) || !d.live.contains(handle) || !(0.0..=1.0).contains(&dropout) {
            return Err(CudnnError::BadParam);
        }
        if states_size < STATES_SIZE + d.hidden_states_need || !d.covered(states, states_size) {
            return Err(CudnnError::InvalidValue);
        }
        d.seeds.push(seed);
        d.dropout_descs.insert(
            *desc,
            Some(DropoutState {
                dropout,
                rng: StdRng::seed_from_u64(seed),
            }),
        );
        Ok(())
    }

    fn alloc_scratch(&self, bytes: usize) -> Result<FakeScratch, CudnnError> {
        let mut d = self.device.borrow_mut();
        let ptr = d.id();
        d.call("cudaMalloc", ptr)?;
        d.allocations.insert(ptr, bytes);
        Ok(FakeScratch { ptr, len: bytes })
    }

    fn free_scratch(&self, scratch: FakeScratch) -> Result<(), CudnnError> {
        let mut d = self.device.borrow_mut();
        d.call("cudaFree", scratch.ptr)?;
        match d.allocations.remove(&scratch.ptr) {
            Some(len) if len == scratch.len => Ok(()),
            _ => Err(CudnnError::Driver(1)),
        }
    }

    fn scratch_ptr(&self, scratch: &FakeScratch, offset: usize) -> u64 {
        scratch.ptr + offset as u64
    }

    fn set_stream(&self, handle: &mut u64, stream: u64) -> Result<(), CudnnError> {
        let mut d = self.device.borrow_mut();
        d.call("cudnnSetStream", stream)?;
        if !d.live.contains(handle) {
            return Err(CudnnError::BadParam);
        }
        d.bound_stream = Some(stream);
        Ok(())
    }

    fn dropout_forward(
        &self,
        handle: &u64,
        dropout_desc: &u64,
        x_desc: &u64,
        x: u64,
        y_desc: &u64,
        y: u64,
        reserve_space: u64,
        reserve_space_size: usize,
    ) -> Result<(), CudnnError> {
        let mut d = self.device.borrow_mut();
        d.call("cudnnDropoutForward", *dropout_desc)?;
        if !d.live.contains(handle) {
            return Err(CudnnError::BadParam);
        }
        let n = d.elements(*x_desc)?;
        if d.elements(*y_desc)? != n {
            return Err(CudnnError::BadParam);
        }
        if reserve_space_size < n || !d.covered(reserve_space, reserve_space_size) {
            return Err(CudnnError::InvalidValue);
        }
        let input = d.buffers.get(&x).cloned().ok_or(CudnnError::MappingError)?;

        let state = d
            .dropout_descs
            .get_mut(dropout_desc)
            .and_then(Option::as_mut)
            .ok_or(CudnnError::BadParam)?;
        let p = state.dropout;
        let mask: Vec<bool> = (0..n).map(|_| state.rng.random::<f32>() >= p).collect();
        let scale = if p < 1.0 { 1.0 / (1.0 - p) } else { 0.0 };
        let output = input
            .iter()
            .zip(&mask)
            .map(|(&v, &keep)| if keep { v * scale } else { 0.0 })
            .collect();

        d.masks.insert(reserve_space, mask);
        d.buffers.insert(y, output);
        Ok(())
    }

    fn dropout_backward(
        &self,
        handle: &u64,
        dropout_desc: &u64,
        dy_desc: &u64,
        dy: u64,
        dx_desc: &u64,
        dx: u64,
        reserve_space: u64,
        reserve_space_size: usize,
    ) -> Result<(), CudnnError> {
        let mut d = self.device.borrow_mut();
        d.call("cudnnDropoutBackward", *dropout_desc)?;
        if !d.live.contains(handle) {
            return Err(CudnnError::BadParam);
        }
        let n = d.elements(*dy_desc)?;
        if d.elements(*dx_desc)? != n {
            return Err(CudnnError::BadParam);
        }
        if reserve_space_size < n || !d.covered(reserve_space, reserve_space_size) {
            return Err(CudnnError::InvalidValue);
        }
        let p = d
            .dropout_descs
            .get(dropout_desc)
            .and_then(Option::as_ref)
            .map(|s| s.dropout)
            .ok_or(CudnnError::BadParam)?;
        let mask = d.masks.get(&reserve_space).cloned().ok_or(CudnnError::BadParam)?;
        if mask.len() != n {
            return Err(CudnnError::BadParam);
        }
        let grad = d.buffers.get(&dy).cloned().ok_or(CudnnError::MappingError)?;
        let scale = if p < 1.0 { 1.0 / (1.0 - p) } else { 0.0 };
        let out = grad
            .iter()
            .zip(&mask)
            .map(|(&g, &keep)| if keep { g * scale } else { 0.0 })
            .collect();
        d.buffers.insert(dx, out);
        Ok(())
    }

    fn synchronize(&self, stream: u64) -> Result<(), CudnnError> {
        self.device.borrow_mut().call("cuStreamSynchronize", stream)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FakeTensor {
    pub ptr: u64,
    shape: Vec<usize>,
    strides: Vec<usize>,
}

impl DeviceTensor for FakeTensor {
    type Elem = f32;

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn strides(&self) -> &[usize] {
        &self.strides
    }
}

#[derive(Debug, thiserror::Error)]
#[error("tensor at {0:#x} is not resident")]
pub struct NotResident(u64);

#[derive(Clone)]
pub struct FakeMemory {
    device: Rc<RefCell<Device>>,
}

impl MemoryManager<FakeRuntime> for FakeMemory {
    type Tensor = FakeTensor;
    type Error = NotResident;

    fn resolve(
        &self,
        src: &FakeTensor,
        dst: &mut FakeTensor,
    ) -> Result<Binding<u64, u64>, NotResident> {
        let mut d = self.device.borrow_mut();
        d.calls.push(("resolve", src.ptr));
        if d.fail_resolve {
            return Err(NotResident(src.ptr));
        }
        Ok(Binding {
            src: src.ptr,
            dst: dst.ptr,
            stream: d.stream,
        })
    }

    fn notify_completed(
        &self,
        stream: u64,
        _src: &FakeTensor,
        _dst: &FakeTensor,
    ) -> Result<(), NotResident> {
        self.device.borrow_mut().calls.push(("notify_completed", stream));
        Ok(())
    }
}

/// Hands out a fixed sequence of seeds, repeating the last one.
#[derive(Debug, Clone)]
pub struct Seeds(VecDeque<u64>);

impl Seeds {
    pub fn new(seeds: &[u64]) -> Self {
        Self(seeds.iter().copied().collect())
    }
}

impl SeedSource for Seeds {
    fn next_seed(&mut self) -> u64 {
        if self.0.len() > 1 {
            self.0.pop_front().unwrap_or_default()
        } else {
            self.0.front().copied().unwrap_or_default()
        }
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("CUDNN_DROPOUT_LOG"))
        .with_test_writer()
        .try_init();
}
