//! COG reader: open a raster, decode it and hand it out as an array or tensor
//!
//! Opening reads only the TIFF header and the IFD chain. Pixels are fetched on
//! the first decode, chunk by chunk through range requests, and the result is
//! cached in the reader:
//! - [`CogReader::decode_host`] decodes the full-resolution image once
//! - [`CogReader::to_array`] borrows it as a typed `ArrayView3`
//! - [`CogReader::dlpack`] moves it into a DLPack tensor without copying
//! - [`CogReader::coordinates`] derives the pixel-center axes once

use std::sync::{Arc, OnceLock};

use dlpark::SafeManagedTensorVersioned;
use dlpark::ffi::Device;
use ndarray::{Array3, ArrayView1, ArrayView3};
use tracing::debug;

use crate::config::ReaderConfig;
use crate::directory::{ImageDirectory, read_directories};
use crate::error::{CogError, CogResult};
use crate::geo::{CoordinateAxes, GeoTransform};
use crate::path::RasterLocation;
use crate::range_reader::{RangeReader, create_range_reader};
use crate::raster::{CogDataType, RasterBuffer, Sample};
use crate::scheduler::{DecodeScheduler, Window};
use crate::tiff_utils::TiffHeader;

/// Runs `$body` with `$t` bound to the Rust type of a [`CogDataType`].
macro_rules! with_sample_type {
    ($dtype:expr, $t:ident => $body:expr) => {
        match $dtype {
            $crate::raster::CogDataType::UInt8 => {
                type $t = u8;
                $body
            }
            $crate::raster::CogDataType::UInt16 => {
                type $t = u16;
                $body
            }
            $crate::raster::CogDataType::UInt32 => {
                type $t = u32;
                $body
            }
            $crate::raster::CogDataType::UInt64 => {
                type $t = u64;
                $body
            }
            $crate::raster::CogDataType::Int8 => {
                type $t = i8;
                $body
            }
            $crate::raster::CogDataType::Int16 => {
                type $t = i16;
                $body
            }
            $crate::raster::CogDataType::Int32 => {
                type $t = i32;
                $body
            }
            $crate::raster::CogDataType::Int64 => {
                type $t = i64;
                $body
            }
            $crate::raster::CogDataType::Float32 => {
                type $t = f32;
                $body
            }
            $crate::raster::CogDataType::Float64 => {
                type $t = f64;
                $body
            }
        }
    };
}
pub(crate) use with_sample_type;

/// COG Reader - one opened raster and its decode caches
pub struct CogReader {
    location: Option<RasterLocation>,
    reader: Arc<dyn RangeReader>,
    header: TiffHeader,
    directory: ImageDirectory,
    /// Reduced-resolution levels, largest first
    overviews: Vec<ImageDirectory>,
    scheduler: DecodeScheduler,
    host: OnceLock<RasterBuffer>,
    coords: OnceLock<CoordinateAxes>,
}

impl std::fmt::Debug for CogReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CogReader")
            .field("source", &self.reader.identifier())
            .field("width", &self.directory.width)
            .field("height", &self.directory.height)
            .field("bands", &self.directory.bands)
            .field("dtype", &self.directory.data_type)
            .field("overviews", &self.overviews.len())
            .finish_non_exhaustive()
    }
}

impl CogReader {
    /// Open a COG from a local path or an HTTP(S) URL, configured from the
    /// environment.
    pub fn open(path: &str) -> CogResult<Self> {
        Self::open_with_config(path, &ReaderConfig::from_env())
    }

    pub fn open_with_config(path: &str, config: &ReaderConfig) -> CogResult<Self> {
        let location = RasterLocation::parse(path)?;
        let reader = create_range_reader(&location, config)?;
        let mut cog = Self::from_reader(reader, config)?;
        cog.location = Some(location);
        Ok(cog)
    }

    /// Open from an existing range reader
    pub fn from_reader(reader: Arc<dyn RangeReader>, config: &ReaderConfig) -> CogResult<Self> {
        let (header, directory, overviews) = read_directories(reader.as_ref())?;
        let scheduler = DecodeScheduler::new(config)?;
        debug!(
            source = %reader.identifier(),
            variant = ?header.variant,
            overviews = overviews.len(),
            threads = scheduler.threads(),
            "Opened COG"
        );
        Ok(Self {
            location: None,
            reader,
            header,
            directory,
            overviews,
            scheduler,
            host: OnceLock::new(),
            coords: OnceLock::new(),
        })
    }

    /// Where the raster was opened from; `None` for readers built with
    /// [`CogReader::from_reader`].
    #[must_use]
    pub fn location(&self) -> Option<&RasterLocation> {
        self.location.as_ref()
    }

    #[must_use]
    pub fn identifier(&self) -> &str {
        self.reader.identifier()
    }

    #[must_use]
    pub fn header(&self) -> &TiffHeader {
        &self.header
    }

    /// The full-resolution directory
    #[must_use]
    pub fn directory(&self) -> &ImageDirectory {
        &self.directory
    }

    #[must_use]
    pub fn overviews(&self) -> &[ImageDirectory] {
        &self.overviews
    }

    #[must_use]
    pub fn bands(&self) -> usize {
        self.directory.bands
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.directory.width
    }

    #[must_use]
    pub fn height(&self) -> usize {
        self.directory.height
    }

    #[must_use]
    pub fn dtype(&self) -> CogDataType {
        self.directory.data_type
    }

    #[must_use]
    pub fn geo_transform(&self) -> Option<&GeoTransform> {
        self.directory.geo_transform.as_ref()
    }

    #[must_use]
    pub fn epsg(&self) -> Option<u32> {
        self.directory.epsg()
    }

    #[must_use]
    pub fn nodata(&self) -> Option<f64> {
        self.directory.nodata
    }

    pub(crate) fn range_reader(&self) -> &dyn RangeReader {
        self.reader.as_ref()
    }

    pub(crate) fn scheduler(&self) -> &DecodeScheduler {
        &self.scheduler
    }

    fn decode(&self, directory: &ImageDirectory, window: Window) -> CogResult<RasterBuffer> {
        with_sample_type!(directory.data_type, T => {
            let array = self
                .scheduler
                .decode_window::<T>(self.reader.as_ref(), directory, window)?;
            Ok(RasterBuffer::new(array))
        })
    }

    /// Decode the full-resolution image into host memory.
    ///
    /// The first call does the work; later calls return the cached buffer.
    pub fn decode_host(&self) -> CogResult<&RasterBuffer> {
        if let Some(buffer) = self.host.get() {
            return Ok(buffer);
        }
        let buffer = self.decode(&self.directory, Window::full(&self.directory))?;
        Ok(self.host.get_or_init(|| buffer))
    }

    /// Borrow the decoded image as a `(bands, height, width)` array of `T`.
    pub fn to_array<T: Sample>(&self) -> CogResult<ArrayView3<'_, T>> {
        self.decode_host()?.view::<T>()
    }

    /// Decode the full-resolution image and take ownership of it, leaving the
    /// reader without a cached buffer.
    pub fn into_host(mut self) -> CogResult<RasterBuffer> {
        match self.host.take() {
            Some(buffer) => Ok(buffer),
            None => self.decode(&self.directory, Window::full(&self.directory)),
        }
    }

    /// Decode a pixel window of the full-resolution image. Nothing is cached.
    pub fn read_window(&self, window: Window) -> CogResult<RasterBuffer> {
        self.decode(&self.directory, window)
    }

    /// Decode overview `level` (0 is the largest reduced level).
    pub fn read_overview(&self, level: usize) -> CogResult<RasterBuffer> {
        let directory = self
            .overviews
            .get(level)
            .ok_or(CogError::OverviewOutOfRange {
                level,
                available: self.overviews.len(),
            })?;
        self.decode(directory, Window::full(directory))
    }

    /// Export the decoded image as a DLPack tensor of shape
    /// `[bands, height, width]`.
    ///
    /// The cached buffer is moved into the tensor; a later call decodes again.
    pub fn dlpack(&mut self) -> CogResult<SafeManagedTensorVersioned> {
        let buffer = match self.host.take() {
            Some(buffer) => buffer,
            None => self.decode(&self.directory, Window::full(&self.directory))?,
        };
        buffer.into_dlpack()
    }

    /// DLPack `(device_type, device_id)` of [`CogReader::dlpack`] tensors.
    #[must_use]
    pub fn dlpack_device(&self) -> (i32, i32) {
        let device = Device::CPU;
        (device.device_type as i32, device.device_id)
    }

    /// Pixel-center coordinate axes, derived on first use.
    pub fn coordinates(&self) -> CogResult<&CoordinateAxes> {
        if let Some(axes) = self.coords.get() {
            return Ok(axes);
        }
        let axes = self.directory.coordinates()?;
        Ok(self.coords.get_or_init(|| axes))
    }

    /// `(x, y)` coordinate views, one value per column and per row.
    pub fn xy_coords(&self) -> CogResult<(ArrayView1<'_, f64>, ArrayView1<'_, f64>)> {
        let axes = self.coordinates()?;
        Ok((axes.x.view(), axes.y.view()))
    }
}

/// Read a GeoTIFF into host memory in its native sample type.
pub fn read_geotiff(path: &str) -> CogResult<RasterBuffer> {
    CogReader::open(path)?.into_host()
}

/// Read a GeoTIFF whose samples are `T`.
pub fn read_geotiff_as<T: Sample>(path: &str) -> CogResult<Array3<T>> {
    read_geotiff(path)?.into_array::<T>()
}
