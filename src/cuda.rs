//! GPU decode path (feature `cuda`)
//!
//! Chunks are fetched and decompressed on the host worker pool exactly like the
//! CPU path, then every row span of a decoded tile row is uploaded straight into
//! its slot of a CHW buffer in device memory. All device calls are issued from
//! the calling thread on the stream the caller passes in; the stream is
//! synchronized once per tile row before the host staging tiles are dropped.

use std::ffi::c_void;
use std::sync::Arc;

use cudarc::driver::{CudaSlice, CudaStream, DevicePtr, DeviceRepr, ValidAsZeroBits};
use dlpark::SafeManagedTensorVersioned;
use dlpark::ffi::{DataType, Device};
use dlpark::traits::{RowMajorCompactLayout, TensorLike};
use ndarray::{Array3, ArrayView1};
use tracing::debug;

use crate::assembler::row_spans;
use crate::cog_reader::{CogReader, with_sample_type};
use crate::error::{CogError, CogResult};
use crate::geo::CoordinateAxes;
use crate::raster::{CogDataType, RasterBuffer, Sample};
use crate::scheduler::Window;

/// A sample type that can live in device memory
pub trait DeviceSample: Sample + DeviceRepr + ValidAsZeroBits {}

impl<T: Sample + DeviceRepr + ValidAsZeroBits> DeviceSample for T {}

/// Device buffer of one of the supported sample types
pub enum DeviceData {
    UInt8(CudaSlice<u8>),
    UInt16(CudaSlice<u16>),
    UInt32(CudaSlice<u32>),
    UInt64(CudaSlice<u64>),
    Int8(CudaSlice<i8>),
    Int16(CudaSlice<i16>),
    Int32(CudaSlice<i32>),
    Int64(CudaSlice<i64>),
    Float32(CudaSlice<f32>),
    Float64(CudaSlice<f64>),
}

macro_rules! with_slice {
    ($data:expr, $slice:ident => $body:expr) => {
        match $data {
            DeviceData::UInt8($slice) => $body,
            DeviceData::UInt16($slice) => $body,
            DeviceData::UInt32($slice) => $body,
            DeviceData::UInt64($slice) => $body,
            DeviceData::Int8($slice) => $body,
            DeviceData::Int16($slice) => $body,
            DeviceData::Int32($slice) => $body,
            DeviceData::Int64($slice) => $body,
            DeviceData::Float32($slice) => $body,
            DeviceData::Float64($slice) => $body,
        }
    };
}

trait IntoDeviceData: Sized {
    fn into_device_data(slice: CudaSlice<Self>) -> DeviceData;
}

macro_rules! impl_into_device_data {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl IntoDeviceData for $t {
                fn into_device_data(slice: CudaSlice<Self>) -> DeviceData {
                    DeviceData::$variant(slice)
                }
            }
        )*
    };
}

impl_into_device_data!(
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

/// Flat DLPack tensor owning a device allocation
struct DeviceTensor<T> {
    slice: CudaSlice<T>,
    ptr: *mut c_void,
    ordinal: usize,
}

impl<T: DeviceSample> DeviceTensor<T> {
    fn new(slice: CudaSlice<T>, stream: &CudaStream, ordinal: usize) -> Self {
        let ptr = {
            let (ptr, _record) = slice.device_ptr(stream);
            ptr as usize as *mut c_void
        };
        Self { slice, ptr, ordinal }
    }
}

impl<T: DeviceSample> TensorLike<RowMajorCompactLayout> for DeviceTensor<T> {
    type Error = dlpark::Error;

    fn data_ptr(&self) -> *mut c_void {
        self.ptr
    }

    fn memory_layout(&self) -> RowMajorCompactLayout {
        RowMajorCompactLayout::new(vec![self.slice.len() as i64])
    }

    fn device(&self) -> dlpark::Result<Device> {
        Ok(Device::cuda(self.ordinal))
    }

    fn data_type(&self) -> dlpark::Result<DataType> {
        Ok(T::data_type())
    }

    fn byte_offset(&self) -> u64 {
        0
    }
}

/// A CHW raster decoded into device memory
pub struct DeviceRaster {
    pub bands: usize,
    pub height: usize,
    pub width: usize,
    pub dtype: CogDataType,
    /// CUDA device ordinal holding `data`
    pub ordinal: usize,
    data: DeviceData,
    stream: Arc<CudaStream>,
}

impl DeviceRaster {
    pub fn len(&self) -> usize {
        self.bands * self.height * self.width
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data(&self) -> &DeviceData {
        &self.data
    }

    /// Export as a flat, channel-major DLPack tensor of `bands * height * width`
    /// elements. The device allocation moves into the tensor.
    pub fn into_dlpack(self) -> CogResult<SafeManagedTensorVersioned> {
        let dtype = self.dtype;
        let (stream, ordinal) = (self.stream, self.ordinal);
        with_slice!(self.data, slice => {
            let tensor = DeviceTensor::new(slice, &stream, ordinal);
            SafeManagedTensorVersioned::new(tensor).map_err(|_| {
                CogError::Export(format!("cannot wrap {dtype:?} device buffer as a DLPack tensor"))
            })
        })
    }

    /// DLPack `(device_type, device_id)` of [`DeviceRaster::into_dlpack`] tensors.
    pub fn dlpack_device(&self) -> (i32, i32) {
        let device = Device::cuda(self.ordinal);
        (device.device_type as i32, device.device_id)
    }

    /// Copy the device buffer back into a host raster.
    pub fn copy_to_host(&self) -> CogResult<RasterBuffer> {
        let shape = (self.bands, self.height, self.width);
        with_slice!(&self.data, slice => {
            let host = self.stream.memcpy_dtov(slice)?;
            let array = Array3::from_shape_vec(shape, host)
                .map_err(|e| CogError::Export(e.to_string()))?;
            Ok(RasterBuffer::new(array))
        })
    }
}

impl CogReader {
    /// Decode the full-resolution image into device memory on `stream`.
    pub fn decode_device(&self, stream: &Arc<CudaStream>) -> CogResult<DeviceRaster> {
        let directory = self.directory();
        with_sample_type!(directory.data_type, T => {
            let data = T::into_device_data(self.upload::<T>(stream)?);
            Ok(DeviceRaster {
                bands: directory.bands,
                height: directory.height,
                width: directory.width,
                dtype: directory.data_type,
                ordinal: stream.context().ordinal(),
                data,
                stream: Arc::clone(stream),
            })
        })
    }

    fn upload<T: DeviceSample>(&self, stream: &Arc<CudaStream>) -> CogResult<CudaSlice<T>> {
        let directory = self.directory();
        let window = Window::full(directory);
        let mut device = stream.alloc_zeros::<T>(directory.bands * window.width * window.height)?;
        debug!(
            source = %self.identifier(),
            ordinal = stream.context().ordinal(),
            elements = device.len(),
            "Allocated device raster"
        );

        self.scheduler().stream_tile_rows::<T, _>(
            self.range_reader(),
            directory,
            window,
            |tile_row, tiles| {
                for tile in &tiles {
                    for span in row_spans(directory, &window, tile) {
                        let at = span.flat_offset(&window);
                        let mut slot = device.slice_mut(at..at + span.len);
                        stream.memcpy_htod(&tile.samples[span.src()], &mut slot)?;
                    }
                }
                // staging tiles must outlive the copies queued from them
                stream.synchronize()?;
                debug!(tile_row, tiles = tiles.len(), "Uploaded tile row");
                Ok(())
            },
        )?;
        Ok(device)
    }
}

/// COG reader that decodes straight into GPU memory
pub struct CudaCogReader {
    reader: CogReader,
    stream: Arc<CudaStream>,
}

impl CudaCogReader {
    /// Open `path` for decoding on `stream`. Only the directories are read
    /// here; pixels are decoded by [`CudaCogReader::dlpack`].
    pub fn new(path: &str, stream: &Arc<CudaStream>) -> CogResult<Self> {
        Ok(Self {
            reader: CogReader::open(path)?,
            stream: Arc::clone(stream),
        })
    }

    pub fn reader(&self) -> &CogReader {
        &self.reader
    }

    pub fn bands(&self) -> usize {
        self.reader.bands()
    }

    pub fn decode(&self) -> CogResult<DeviceRaster> {
        self.reader.decode_device(&self.stream)
    }

    /// Decode and export as a flat device tensor.
    pub fn dlpack(&self) -> CogResult<SafeManagedTensorVersioned> {
        self.decode()?.into_dlpack()
    }

    pub fn dlpack_device(&self) -> (i32, i32) {
        let device = Device::cuda(self.stream.context().ordinal());
        (device.device_type as i32, device.device_id)
    }

    pub fn coordinates(&self) -> CogResult<&CoordinateAxes> {
        self.reader.coordinates()
    }

    pub fn xy_coords(&self) -> CogResult<(ArrayView1<'_, f64>, ArrayView1<'_, f64>)> {
        self.reader.xy_coords()
    }
}
