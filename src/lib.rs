//! # cogtensor - Cloud Optimized GeoTIFF to tensor reader
//!
//! Reads Cloud Optimized GeoTIFFs from local disk or HTTP(S) into multi-band
//! CHW arrays, without GDAL.
//!
//! ## Features
//!
//! - **Metadata-only open**: only the header and IFD chain are read up front
//! - **Range requests**: tiles and strips are fetched individually, never the whole file
//! - **Parallel decode**: chunks are decompressed on a bounded rayon pool
//! - **Compression**: Deflate, Zstandard and uncompressed, with predictors 2 and 3
//! - **Layouts**: tiled and stripped, chunky and planar, classic TIFF and BigTIFF
//! - **Coordinates**: pixel-center x/y axes from the GeoTIFF transform
//! - **DLPack**: zero-copy CPU tensors, and device tensors with the `cuda` feature
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use cogtensor::CogReader;
//!
//! let mut reader = CogReader::open("https://example.com/scene.tif")?;
//! let pixels = reader.to_array::<f32>()?;
//! println!("{} bands of {}x{}", reader.bands(), reader.width(), reader.height());
//!
//! let (x, y) = reader.xy_coords()?;
//! let tensor = reader.dlpack()?;
//! ```
//!
//! ## Architecture
//!
//! - [`path`]: classify an input as a local path or a remote URL
//! - [`range_reader`]: byte-range I/O over local files, HTTP and memory
//! - [`tiff_utils`], [`directory`], [`geo`]: TIFF/GeoTIFF directory parsing
//! - [`codec`]: decompression, predictors and sample conversion per chunk
//! - [`scheduler`]: concurrent fetch and decode of the chunks covering a window
//! - [`assembler`]: placing decoded chunks into the CHW buffer
//! - [`cog_reader`], [`raster`]: the reader and its host export surface
//! - `cuda` (feature `cuda`): decoding into device memory

// ============================================================================
// Public modules
// ============================================================================

pub mod assembler;
pub mod codec;
pub mod cog_reader;
pub mod config;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod directory;
pub mod error;
pub mod geo;
pub mod path;
pub mod range_reader;
pub mod raster;
pub mod scheduler;
pub mod tiff_utils;

#[cfg(test)]
mod test_support;

// ============================================================================
// Core Reader
// ============================================================================

pub use cog_reader::{
    CogReader,
    read_geotiff,
    read_geotiff_as,
};

pub use config::ReaderConfig;

pub use error::{
    CogError,
    CogResult,
    UnsupportedFormat,
};

// ============================================================================
// Rasters & Coordinates
// ============================================================================

pub use raster::{
    CogDataType,
    RasterBuffer,
    RasterData,
    Sample,
};

pub use geo::{
    CoordinateAxes,
    GeoTransform,
    RasterType,
};

pub use directory::ImageDirectory;

pub use scheduler::Window;

// ============================================================================
// Range Readers (I/O Abstraction)
// ============================================================================

pub use path::RasterLocation;

pub use range_reader::{
    RangeReader,
    LocalRangeReader,
    HttpRangeReader,
    MemoryRangeReader,
    create_range_reader,
};

// ============================================================================
// GPU
// ============================================================================

#[cfg(feature = "cuda")]
pub use cuda::{
    CudaCogReader,
    DeviceRaster,
};
