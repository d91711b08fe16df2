use crate::{CudnnError, DataKind, DropoutRuntime};
use cudarc::{
    cudnn::sys,
    driver::{result as driver, sys as driver_sys, DriverError},
};
use std::{ffi::c_void, mem::MaybeUninit};

/// [`DropoutRuntime`] backed by the cuDNN library, loaded at runtime.
///
/// All calls go to the CUDA context current on the calling thread. Create one (for example
/// through `cudarc::driver::CudaDevice::new`) before building a helper, and keep using the
/// helper from threads where that context is current.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CudnnRuntime;

/// Device memory allocated with `cuMemAlloc`.
#[derive(Debug)]
pub struct DeviceAllocation {
    ptr: driver_sys::CUdeviceptr,
    len: usize,
}

impl DeviceAllocation {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

fn into_result(status: sys::cudnnStatus_t) -> Result<(), CudnnError> {
    match CudnnError::from_raw(status as u32) {
        None => Ok(()),
        Some(err) => Err(err),
    }
}

fn driver_error(err: DriverError) -> CudnnError {
    CudnnError::Driver(err.0 as u32)
}

fn raw_data_type(kind: DataKind) -> sys::cudnnDataType_t {
    match kind {
        DataKind::Float => sys::cudnnDataType_t::CUDNN_DATA_FLOAT,
        DataKind::Double => sys::cudnnDataType_t::CUDNN_DATA_DOUBLE,
    }
}

fn as_void(ptr: driver_sys::CUdeviceptr) -> *mut c_void {
    ptr as usize as *mut c_void
}

impl DropoutRuntime for CudnnRuntime {
    type Handle = sys::cudnnHandle_t;
    type TensorDesc = sys::cudnnTensorDescriptor_t;
    type DropoutDesc = sys::cudnnDropoutDescriptor_t;
    type Scratch = DeviceAllocation;
    type DevicePtr = driver_sys::CUdeviceptr;
    type Stream = driver_sys::CUstream;

    fn create_handle(&self) -> Result<Self::Handle, CudnnError> {
        let mut raw = MaybeUninit::uninit();

        unsafe {
            into_result(sys::lib().cudnnCreate(raw.as_mut_ptr()))?;
            Ok(raw.assume_init())
        }
    }

    fn destroy_handle(&self, handle: Self::Handle) -> Result<(), CudnnError> {
        unsafe { into_result(sys::lib().cudnnDestroy(handle)) }
    }

    fn version(&self) -> (u32, u32, u32) {
        unsafe {
            // cudnnGetVersion does not return a state as it never fails.
            let version = sys::lib().cudnnGetVersion();
            if version >= 90000 {
                (
                    (version / 10000) as u32,
                    ((version % 10000) / 100) as u32,
                    (version % 100) as u32,
                )
            } else {
                (
                    (version / 1000) as u32,
                    ((version % 1000) / 100) as u32,
                    (version % 100) as u32,
                )
            }
        }
    }

    fn create_tensor_descriptor(&self) -> Result<Self::TensorDesc, CudnnError> {
        let mut raw = MaybeUninit::uninit();

        unsafe {
            into_result(sys::lib().cudnnCreateTensorDescriptor(raw.as_mut_ptr()))?;
            Ok(raw.assume_init())
        }
    }

    fn set_tensor_descriptor(
        &self,
        desc: &mut Self::TensorDesc,
        data_type: DataKind,
        shape: &[i32],
        strides: &[i32],
    ) -> Result<(), CudnnError> {
        if shape.len() != strides.len() {
            return Err(CudnnError::BadParam);
        }

        unsafe {
            into_result(sys::lib().cudnnSetTensorNdDescriptor(
                *desc,
                raw_data_type(data_type),
                shape.len() as i32,
                shape.as_ptr(),
                strides.as_ptr(),
            ))
        }
    }

    fn destroy_tensor_descriptor(&self, desc: Self::TensorDesc) -> Result<(), CudnnError> {
        unsafe { into_result(sys::lib().cudnnDestroyTensorDescriptor(desc)) }
    }

    fn create_dropout_descriptor(&self) -> Result<Self::DropoutDesc, CudnnError> {
        let mut raw = MaybeUninit::uninit();

        unsafe {
            into_result(sys::lib().cudnnCreateDropoutDescriptor(raw.as_mut_ptr()))?;
            Ok(raw.assume_init())
        }
    }

    fn destroy_dropout_descriptor(&self, desc: Self::DropoutDesc) -> Result<(), CudnnError> {
        unsafe { into_result(sys::lib().cudnnDestroyDropoutDescriptor(desc)) }
    }

    fn dropout_states_size(&self, handle: &Self::Handle) -> Result<usize, CudnnError> {
        let mut size = MaybeUninit::uninit();

        unsafe {
            into_result(sys::lib().cudnnDropoutGetStatesSize(*handle, size.as_mut_ptr()))?;
            Ok(size.assume_init())
        }
    }

    fn dropout_reserve_space_size(&self, x_desc: &Self::TensorDesc) -> Result<usize, CudnnError> {
        let mut size = MaybeUninit::uninit();

        unsafe {
            into_result(sys::lib().cudnnDropoutGetReserveSpaceSize(*x_desc, size.as_mut_ptr()))?;
            Ok(size.assume_init())
        }
    }

    fn set_dropout_descriptor(
        &self,
        desc: &mut Self::DropoutDesc,
        handle: &Self::Handle,
        dropout: f32,
        states: Self::DevicePtr,
        states_size: usize,
        seed: u64,
    ) -> Result<(), CudnnError> {
        unsafe {
            into_result(sys::lib().cudnnSetDropoutDescriptor(
                *desc,
                *handle,
                dropout,
                as_void(states),
                states_size,
                seed as _,
            ))
        }
    }

    fn alloc_scratch(&self, bytes: usize) -> Result<Self::Scratch, CudnnError> {
        if bytes == 0 {
            return Ok(DeviceAllocation { ptr: 0, len: 0 });
        }

        let ptr = unsafe { driver::malloc_sync(bytes) }.map_err(driver_error)?;
        Ok(DeviceAllocation { ptr, len: bytes })
    }

    fn free_scratch(&self, scratch: Self::Scratch) -> Result<(), CudnnError> {
        if scratch.is_empty() {
            return Ok(());
        }

        unsafe { driver::free_sync(scratch.ptr) }.map_err(driver_error)
    }

    fn scratch_ptr(&self, scratch: &Self::Scratch, offset: usize) -> Self::DevicePtr {
        scratch.ptr + offset as driver_sys::CUdeviceptr
    }

    fn set_stream(&self, handle: &mut Self::Handle, stream: Self::Stream) -> Result<(), CudnnError> {
        unsafe { into_result(sys::lib().cudnnSetStream(*handle, stream as sys::cudaStream_t)) }
    }

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
    ) -> Result<(), CudnnError> {
        unsafe {
            into_result(sys::lib().cudnnDropoutForward(
                *handle,
                *dropout_desc,
                *x_desc,
                as_void(x) as *const c_void,
                *y_desc,
                as_void(y),
                as_void(reserve_space),
                reserve_space_size,
            ))
        }
    }

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
    ) -> Result<(), CudnnError> {
        unsafe {
            into_result(sys::lib().cudnnDropoutBackward(
                *handle,
                *dropout_desc,
                *dy_desc,
                as_void(dy) as *const c_void,
                *dx_desc,
                as_void(dx),
                as_void(reserve_space),
                reserve_space_size,
            ))
        }
    }

    fn synchronize(&self, stream: Self::Stream) -> Result<(), CudnnError> {
        unsafe { driver::stream::synchronize(stream) }.map_err(driver_error)
    }
}
