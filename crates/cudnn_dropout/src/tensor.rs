use crate::{DataType, DropoutError};

/// Minimum rank accepted by `cudnnSetTensorNdDescriptor` for the dropout primitive. Lower rank
/// tensors are padded with unit dimensions.
pub const MIN_RANK: usize = 4;

/// `CUDNN_DIM_MAX`.
pub const MAX_RANK: usize = 8;

/// A tensor living in device memory, as seen by the dropout helper.
///
/// Only shape and strides are read. Device addresses are obtained through the
/// [`MemoryManager`](crate::MemoryManager), never from the tensor itself.
pub trait DeviceTensor {
    type Elem: DataType;

    fn shape(&self) -> &[usize];

    /// Strides in elements, one per dimension.
    fn strides(&self) -> &[usize];

    fn len(&self) -> usize {
        self.shape().iter().product()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shape and strides normalized for a runtime tensor descriptor.
///
/// Both are padded to [`MIN_RANK`] by appending unit dimensions, never truncated, and every
/// extent is checked to fit the descriptor's `int` fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorLayout {
    shape: Vec<i32>,
    strides: Vec<i32>,
}

impl TensorLayout {
    pub fn new(shape: &[usize], strides: &[usize]) -> Result<Self, DropoutError> {
        if shape.len() != strides.len() {
            return Err(DropoutError::ShapeMismatch {
                what: "shape and strides rank",
                left: vec![shape.len()],
                right: vec![strides.len()],
            });
        }
        if shape.len() > MAX_RANK {
            return Err(DropoutError::RankTooLarge {
                rank: shape.len(),
                max: MAX_RANK,
            });
        }

        Ok(Self {
            shape: pad(shape)?,
            strides: pad(strides)?,
        })
    }

    pub fn of<T: DeviceTensor + ?Sized>(tensor: &T) -> Result<Self, DropoutError> {
        Self::new(tensor.shape(), tensor.strides())
    }

    pub fn shape(&self) -> &[i32] {
        &self.shape
    }

    pub fn strides(&self) -> &[i32] {
        &self.strides
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements described, padding dimensions included (they are all 1).
    pub fn len(&self) -> usize {
        self.shape.iter().map(|&d| d as usize).product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn pad(values: &[usize]) -> Result<Vec<i32>, DropoutError> {
    let mut out = Vec::with_capacity(values.len().max(MIN_RANK));
    for &v in values {
        out.push(i32::try_from(v).map_err(|_| DropoutError::DimensionOverflow(v))?);
    }
    out.resize(out.len().max(MIN_RANK), 1);
    Ok(out)
}
