//! Strip/tile codec: decompression, predictor reversal and sample conversion

use std::io::Read;

use flate2::read::ZlibDecoder;
use thiserror::Error;
use tracing::trace;

use crate::error::UnsupportedFormat;
use crate::raster::{CogDataType, Sample};
use crate::tiff_utils::{ByteOrder, CompressionMethod, SampleFormat};

/// Why a single chunk failed to decode
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("deflate stream is corrupt: {0}")]
    Deflate(#[source] std::io::Error),

    #[error("zstd stream is corrupt: {0}")]
    Zstd(#[source] std::io::Error),

    #[error("expected {expected} decoded bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
}

/// Compression schemes the codec can undo
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Deflate,
    Zstd,
}

impl Compression {
    pub fn from_method(method: CompressionMethod) -> Result<Self, UnsupportedFormat> {
        match method {
            CompressionMethod::None => Ok(Compression::None),
            CompressionMethod::Deflate | CompressionMethod::OldDeflate => Ok(Compression::Deflate),
            CompressionMethod::ZSTD => Ok(Compression::Zstd),
            other => Err(UnsupportedFormat::Compression(other)),
        }
    }
}

/// TIFF `Predictor` tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predictor {
    None,
    /// Horizontal differencing of integer samples
    Horizontal,
    /// Byte-plane shuffle plus differencing of IEEE floats
    FloatingPoint,
}

impl Predictor {
    pub fn from_tag(value: u16, format: SampleFormat) -> Result<Self, UnsupportedFormat> {
        match value {
            1 => Ok(Predictor::None),
            2 => Ok(Predictor::Horizontal),
            3 if format == SampleFormat::IEEEFP => Ok(Predictor::FloatingPoint),
            3 => Err(UnsupportedFormat::FloatingPointPredictor),
            other => Err(UnsupportedFormat::Predictor(other)),
        }
    }
}

/// Everything needed to turn one compressed chunk into samples
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkDecoder {
    pub compression: Compression,
    pub predictor: Predictor,
    pub byte_order: ByteOrder,
    pub data_type: CogDataType,
    /// Interleaved samples per pixel inside one chunk (1 for planar data)
    pub samples_per_pixel: usize,
    /// Fill value for sparse chunks
    pub nodata: Option<f64>,
}

impl ChunkDecoder {
    /// Decode a chunk covering `width` x `rows` pixels.
    ///
    /// Returns exactly `width * rows * samples_per_pixel` samples, pixel
    /// interleaved. An empty input is a sparse chunk and decodes to the nodata
    /// value (zero when the file declares none).
    pub fn decode<T: Sample>(
        &self,
        compressed: &[u8],
        width: usize,
        rows: usize,
    ) -> Result<Vec<T>, CodecError> {
        debug_assert_eq!(T::DATA_TYPE, self.data_type);
        let count = width * rows * self.samples_per_pixel;
        if compressed.is_empty() {
            let fill = self.nodata.map(T::from_f64).unwrap_or_default();
            return Ok(vec![fill; count]);
        }

        let bytes_per_sample = self.data_type.bytes_per_sample();
        let expected = count * bytes_per_sample;
        let mut raw = self.decompress(compressed, expected)?;
        if raw.len() < expected {
            return Err(CodecError::Truncated {
                expected,
                actual: raw.len(),
            });
        }
        raw.truncate(expected);
        trace!(
            compressed = compressed.len(),
            decoded = expected,
            "Decompressed chunk"
        );

        let row_bytes = width * self.samples_per_pixel * bytes_per_sample;
        match self.predictor {
            Predictor::None => {}
            Predictor::Horizontal => {
                for row in raw.chunks_exact_mut(row_bytes) {
                    undo_horizontal(row, self.samples_per_pixel, bytes_per_sample, self.byte_order);
                }
            }
            Predictor::FloatingPoint => {
                let mut scratch = vec![0u8; row_bytes];
                for row in raw.chunks_exact_mut(row_bytes) {
                    undo_floating_point(
                        row,
                        &mut scratch,
                        self.samples_per_pixel,
                        bytes_per_sample,
                        self.byte_order,
                    );
                }
            }
        }

        Ok(raw
            .chunks_exact(bytes_per_sample)
            .map(|bytes| T::from_bytes(bytes, self.byte_order))
            .collect())
    }

    /// Inflate at most one byte past `expected`, enough to tell a short chunk
    /// from a complete one without materializing an oversized stream.
    fn decompress(&self, compressed: &[u8], expected: usize) -> Result<Vec<u8>, CodecError> {
        let limit = expected as u64 + 1;
        let mut out = Vec::with_capacity(expected + 1);
        match self.compression {
            Compression::None => out.extend_from_slice(compressed),
            Compression::Deflate => {
                ZlibDecoder::new(compressed)
                    .take(limit)
                    .read_to_end(&mut out)
                    .map_err(CodecError::Deflate)?;
            }
            Compression::Zstd => {
                zstd::stream::read::Decoder::with_buffer(compressed)
                    .map_err(CodecError::Zstd)?
                    .take(limit)
                    .read_to_end(&mut out)
                    .map_err(CodecError::Zstd)?;
            }
        }
        Ok(out)
    }
}

pub(crate) fn read_uint(bytes: &[u8], order: ByteOrder) -> u64 {
    let fold = |acc: u64, &b: &u8| (acc << 8) | u64::from(b);
    match order {
        ByteOrder::LittleEndian => bytes.iter().rev().fold(0, fold),
        ByteOrder::BigEndian => bytes.iter().fold(0, fold),
    }
}

pub(crate) fn write_uint(bytes: &mut [u8], value: u64, order: ByteOrder) {
    let len = bytes.len();
    for (i, byte) in bytes.iter_mut().enumerate() {
        let shift = match order {
            ByteOrder::LittleEndian => 8 * i,
            ByteOrder::BigEndian => 8 * (len - 1 - i),
        };
        *byte = (value >> shift) as u8;
    }
}

/// Cumulative sum along the row, `stride` samples apart, modulo the sample width.
fn undo_horizontal(row: &mut [u8], stride: usize, bytes_per_sample: usize, order: ByteOrder) {
    if bytes_per_sample == 1 {
        for i in stride..row.len() {
            row[i] = row[i].wrapping_add(row[i - stride]);
        }
        return;
    }
    let samples = row.len() / bytes_per_sample;
    for i in stride..samples {
        let cur = i * bytes_per_sample;
        let prev = (i - stride) * bytes_per_sample;
        let sum = read_uint(&row[cur..cur + bytes_per_sample], order)
            .wrapping_add(read_uint(&row[prev..prev + bytes_per_sample], order));
        write_uint(&mut row[cur..cur + bytes_per_sample], sum, order);
    }
}

/// Undo byte differencing, then gather the byte planes (most significant
/// first) back into samples stored in `order`.
fn undo_floating_point(
    row: &mut [u8],
    scratch: &mut [u8],
    stride: usize,
    bytes_per_sample: usize,
    order: ByteOrder,
) {
    for i in stride..row.len() {
        row[i] = row[i].wrapping_add(row[i - stride]);
    }
    scratch.copy_from_slice(row);

    let samples = row.len() / bytes_per_sample;
    for sample in 0..samples {
        for plane in 0..bytes_per_sample {
            let byte = scratch[plane * samples + sample];
            let at = match order {
                ByteOrder::BigEndian => plane,
                ByteOrder::LittleEndian => bytes_per_sample - 1 - plane,
            };
            row[sample * bytes_per_sample + at] = byte;
        }
    }
}
