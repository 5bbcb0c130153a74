//! Error types for COG decoding
//!
//! Every failure is surfaced as a [`CogError`]. Input validation errors are raised
//! before any I/O, directory errors before any tile I/O, and a single failing tile
//! aborts the whole read.

use thiserror::Error;

use crate::codec::CodecError;
use crate::raster::CogDataType;
use crate::tiff_utils::{CompressionMethod, PhotometricInterpretation, SampleFormat};

/// Result alias used throughout the crate
pub type CogResult<T> = Result<T, CogError>;

/// Main error type for reading Cloud Optimized GeoTIFFs.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CogError {
    /// Input is neither a valid filesystem path nor a valid URL.
    #[error("Cannot parse path: {0}")]
    InvalidPath(String),

    /// Input has a URL scheme other than `http`/`https`/`file`.
    #[error("Cannot parse url: {0}")]
    InvalidUrl(String),

    /// Local file does not exist.
    #[error("Cannot find file: {0}")]
    FileNotFound(String),

    /// The server was reached but the resource does not exist.
    #[error("Cannot find file: {0}")]
    RemoteNotFound(String),

    /// Transport-level HTTP failure.
    #[error("HTTP request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The server answered with an unexpected status.
    #[error("HTTP request to {url} returned status {status}")]
    HttpStatus { url: String, status: u16 },

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Structurally broken TIFF (bad magic, truncated IFD, missing tags).
    #[error("Invalid TIFF: {0}")]
    InvalidTiff(String),

    /// Structurally valid file using an encoding this crate cannot decode.
    #[error("The Decoder does not support the image format `{0}`")]
    UnsupportedFormat(#[from] UnsupportedFormat),

    /// A tile or strip failed to decompress.
    #[error("Corrupt data in chunk {chunk}: {source}")]
    CorruptData {
        chunk: usize,
        #[source]
        source: CodecError,
    },

    /// Typed access with a sample type that does not match the raster.
    #[error("Raster holds {actual:?} samples, {requested:?} was requested")]
    DtypeMismatch {
        requested: CogDataType,
        actual: CogDataType,
    },

    /// Window does not fit inside the raster.
    #[error("Window {x},{y} {width}x{height} exceeds raster of {raster_width}x{raster_height}")]
    InvalidWindow {
        x: usize,
        y: usize,
        width: usize,
        height: usize,
        raster_width: usize,
        raster_height: usize,
    },

    /// Overview level that the file does not contain.
    #[error("Overview level {level} out of range ({available} available)")]
    OverviewOutOfRange { level: usize, available: usize },

    /// The decode worker pool could not be created.
    #[error("Failed to build decode worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// A decoded buffer could not be wrapped as a DLPack tensor.
    #[error("Failed to export tensor: {0}")]
    Export(String),

    /// CUDA driver errors.
    #[cfg(feature = "cuda")]
    #[error("CUDA driver error: {0}")]
    Cuda(#[from] cudarc::driver::DriverError),
}

/// Human-readable reasons a directory is rejected.
///
/// The `Display` output is part of the public contract: it is embedded verbatim in
/// [`CogError::UnsupportedFormat`] messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum UnsupportedFormat {
    #[error("{0:?} with {1:?} bits per sample is unsupported")]
    InterpretationWithBits(PhotometricInterpretation, Vec<u8>),

    #[error("Sample format {0:?} is unsupported")]
    SampleFormat(Vec<SampleFormat>),

    #[error("{0:?} samples with {1} bits are unsupported")]
    SampleFormatWithBits(SampleFormat, u8),

    #[error("Compression method {0:?} is unsupported")]
    Compression(CompressionMethod),

    #[error("Predictor {0} is unsupported")]
    Predictor(u16),

    #[error("Floating point predictor requires floating point samples")]
    FloatingPointPredictor,

    #[error("Planar configuration {0} is unsupported")]
    PlanarConfiguration(u16),

    #[error("Rotated or sheared ModelTransformationTag is unsupported")]
    RotatedTransform,

    #[error("No usable geo transform: {0}")]
    GeoTransform(String),
}
