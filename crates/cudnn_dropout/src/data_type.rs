use crate::private;

/// Element type of the runtime's `cudnnDataType_t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKind {
    Float,
    Double,
}

/// Element types the dropout primitive accepts.
pub trait DataType: private::Sealed + Copy + Send + Sync + 'static {
    const KIND: DataKind;
}

macro_rules! impl_cudnn_data_type {
    ($safe_type:ident, $kind:ident) => {
        impl private::Sealed for $safe_type {}

        impl DataType for $safe_type {
            const KIND: DataKind = DataKind::$kind;
        }
    };
}

impl_cudnn_data_type!(f32, Float);
impl_cudnn_data_type!(f64, Double);
