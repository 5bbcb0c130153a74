//! Typed raster buffers
//!
//! Decoded pixels live in a channel-major (bands, rows, columns) `ndarray::Array3`
//! of the file's native sample type. [`RasterBuffer`] erases the type so one
//! reader can hand out any of the ten supported dtypes.

use std::fmt::Debug;

use dlpark::SafeManagedTensorVersioned;
use dlpark::traits::InferDataType;
use ndarray::{Array3, ArrayView3};

use crate::error::{CogError, CogResult};
use crate::tiff_utils::{ByteOrder, SampleFormat};

/// Data type detected from TIFF tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CogDataType {
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
}

impl CogDataType {
    /// Size of one sample in bytes
    #[must_use]
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            CogDataType::UInt8 | CogDataType::Int8 => 1,
            CogDataType::UInt16 | CogDataType::Int16 => 2,
            CogDataType::UInt32 | CogDataType::Int32 | CogDataType::Float32 => 4,
            CogDataType::UInt64 | CogDataType::Int64 | CogDataType::Float64 => 8,
        }
    }

    /// Resolve a sample format and bit depth; `None` for combinations such as
    /// 16 bit floats.
    #[must_use]
    pub fn from_format(format: SampleFormat, bits_per_sample: u8) -> Option<Self> {
        match (format, bits_per_sample) {
            (SampleFormat::Uint, 8) => Some(CogDataType::UInt8),
            (SampleFormat::Uint, 16) => Some(CogDataType::UInt16),
            (SampleFormat::Uint, 32) => Some(CogDataType::UInt32),
            (SampleFormat::Uint, 64) => Some(CogDataType::UInt64),
            (SampleFormat::Int, 8) => Some(CogDataType::Int8),
            (SampleFormat::Int, 16) => Some(CogDataType::Int16),
            (SampleFormat::Int, 32) => Some(CogDataType::Int32),
            (SampleFormat::Int, 64) => Some(CogDataType::Int64),
            (SampleFormat::IEEEFP, 32) => Some(CogDataType::Float32),
            (SampleFormat::IEEEFP, 64) => Some(CogDataType::Float64),
            _ => None,
        }
    }
}

/// A primitive pixel type a raster can be decoded into
pub trait Sample: Copy + Default + PartialEq + Debug + Send + Sync + InferDataType + 'static {
    const DATA_TYPE: CogDataType;

    /// Decode one sample from exactly `size_of::<Self>()` bytes.
    fn from_bytes(bytes: &[u8], order: ByteOrder) -> Self;

    /// Saturating conversion, used for nodata fill values.
    fn from_f64(value: f64) -> Self;

    fn to_f64(self) -> f64;

    fn into_data(array: Array3<Self>) -> RasterData;

    fn view_data(data: &RasterData) -> Option<ArrayView3<'_, Self>>;

    fn from_data(data: RasterData) -> Result<Array3<Self>, RasterData>;
}

macro_rules! impl_sample {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl Sample for $t {
                const DATA_TYPE: CogDataType = CogDataType::$variant;

                fn from_bytes(bytes: &[u8], order: ByteOrder) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$t>()];
                    raw.copy_from_slice(bytes);
                    match order {
                        ByteOrder::LittleEndian => <$t>::from_le_bytes(raw),
                        ByteOrder::BigEndian => <$t>::from_be_bytes(raw),
                    }
                }

                fn from_f64(value: f64) -> Self {
                    value as $t
                }

                fn to_f64(self) -> f64 {
                    self as f64
                }

                fn into_data(array: Array3<Self>) -> RasterData {
                    RasterData::$variant(array)
                }

                fn view_data(data: &RasterData) -> Option<ArrayView3<'_, Self>> {
                    match data {
                        RasterData::$variant(array) => Some(array.view()),
                        _ => None,
                    }
                }

                fn from_data(data: RasterData) -> Result<Array3<Self>, RasterData> {
                    match data {
                        RasterData::$variant(array) => Ok(array),
                        other => Err(other),
                    }
                }
            }
        )*
    };
}

impl_sample!(
    u8 => UInt8,
    u16 => UInt16,
    u32 => UInt32,
    u64 => UInt64,
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    f32 => Float32,
    f64 => Float64,
);

/// CHW pixel array of one of the supported sample types
#[derive(Debug, Clone, PartialEq)]
pub enum RasterData {
    UInt8(Array3<u8>),
    UInt16(Array3<u16>),
    UInt32(Array3<u32>),
    UInt64(Array3<u64>),
    Int8(Array3<i8>),
    Int16(Array3<i16>),
    Int32(Array3<i32>),
    Int64(Array3<i64>),
    Float32(Array3<f32>),
    Float64(Array3<f64>),
}

macro_rules! with_array {
    ($data:expr, $array:ident => $body:expr) => {
        match $data {
            RasterData::UInt8($array) => $body,
            RasterData::UInt16($array) => $body,
            RasterData::UInt32($array) => $body,
            RasterData::UInt64($array) => $body,
            RasterData::Int8($array) => $body,
            RasterData::Int16($array) => $body,
            RasterData::Int32($array) => $body,
            RasterData::Int64($array) => $body,
            RasterData::Float32($array) => $body,
            RasterData::Float64($array) => $body,
        }
    };
}

impl RasterData {
    pub fn data_type(&self) -> CogDataType {
        match self {
            RasterData::UInt8(_) => CogDataType::UInt8,
            RasterData::UInt16(_) => CogDataType::UInt16,
            RasterData::UInt32(_) => CogDataType::UInt32,
            RasterData::UInt64(_) => CogDataType::UInt64,
            RasterData::Int8(_) => CogDataType::Int8,
            RasterData::Int16(_) => CogDataType::Int16,
            RasterData::Int32(_) => CogDataType::Int32,
            RasterData::Int64(_) => CogDataType::Int64,
            RasterData::Float32(_) => CogDataType::Float32,
            RasterData::Float64(_) => CogDataType::Float64,
        }
    }
}

/// Decoded raster with its sample type erased
#[derive(Debug, Clone, PartialEq)]
pub struct RasterBuffer {
    data: RasterData,
}

impl RasterBuffer {
    pub fn new<T: Sample>(array: Array3<T>) -> Self {
        Self {
            data: T::into_data(array),
        }
    }

    pub fn dtype(&self) -> CogDataType {
        self.data.data_type()
    }

    /// `(bands, height, width)`
    pub fn dim(&self) -> (usize, usize, usize) {
        with_array!(&self.data, array => array.dim())
    }

    pub fn bands(&self) -> usize {
        self.dim().0
    }

    pub fn height(&self) -> usize {
        self.dim().1
    }

    pub fn width(&self) -> usize {
        self.dim().2
    }

    /// Total number of samples, `bands * height * width`
    pub fn len(&self) -> usize {
        with_array!(&self.data, array => array.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data(&self) -> &RasterData {
        &self.data
    }

    /// Borrow the pixels as `T`.
    pub fn view<T: Sample>(&self) -> CogResult<ArrayView3<'_, T>> {
        T::view_data(&self.data).ok_or(CogError::DtypeMismatch {
            requested: T::DATA_TYPE,
            actual: self.dtype(),
        })
    }

    /// Take the pixels out as `T`.
    pub fn into_array<T: Sample>(self) -> CogResult<Array3<T>> {
        T::from_data(self.data).map_err(|data| CogError::DtypeMismatch {
            requested: T::DATA_TYPE,
            actual: data.data_type(),
        })
    }

    /// Hand the buffer over to a DLPack tensor of shape `[bands, height, width]`
    /// without copying.
    pub fn into_dlpack(self) -> CogResult<SafeManagedTensorVersioned> {
        let dtype = self.dtype();
        let export_error =
            || CogError::Export(format!("cannot wrap {dtype:?} raster as a DLPack tensor"));
        with_array!(self.data, array => {
            SafeManagedTensorVersioned::new(array).map_err(|_| export_error())
        })
    }
}
