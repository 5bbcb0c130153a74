//! Image directories: one resolved IFD per resolution level
//!
//! [`ImageDirectory::from_ifd`] turns the raw tags of an IFD into everything
//! needed to locate, shape and decode its pixels. Unsupported encodings are
//! rejected here, before any tile is fetched.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::codec::{ChunkDecoder, Compression, Predictor};
use crate::error::{CogError, CogResult, UnsupportedFormat};
use crate::geo::{CoordinateAxes, GeoKeys, GeoTransform};
use crate::range_reader::RangeReader;
use crate::raster::CogDataType;
use crate::tiff_utils::*;

const SUBFILE_REDUCED_RESOLUTION: u64 = 1;
const SUBFILE_MASK: u64 = 4;

/// `PlanarConfiguration` tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanarConfiguration {
    /// Samples of a pixel are stored together (`RGBRGB...`)
    Chunky,
    /// Each band is stored in its own set of chunks
    Planar,
}

/// How the image is cut into independently compressed chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkLayout {
    Tiled { tile_width: usize, tile_height: usize },
    Striped { rows_per_strip: usize },
}

/// A parsed IFD
#[derive(Debug, Clone)]
pub struct ImageDirectory {
    pub width: usize,
    pub height: usize,
    pub bands: usize,
    pub data_type: CogDataType,
    pub sample_format: SampleFormat,
    pub photometric: PhotometricInterpretation,
    pub bits_per_sample: u8,
    pub compression: Compression,
    pub predictor: Predictor,
    pub planar: PlanarConfiguration,
    pub layout: ChunkLayout,
    /// Byte offset of every chunk, band-major for planar images
    pub tile_offsets: Vec<u64>,
    /// Compressed size of every chunk; 0 marks a sparse chunk
    pub tile_byte_counts: Vec<u64>,
    pub byte_order: ByteOrder,
    pub geo_transform: Option<GeoTransform>,
    pub geo_keys: GeoKeys,
    pub nodata: Option<f64>,
    pub subfile_type: u64,
}

fn narrow<T: TryFrom<u64>>(tag: u16, value: u64) -> CogResult<T> {
    T::try_from(value).map_err(|_| CogError::InvalidTiff(format!("tag {tag} value {value} out of range")))
}

/// All values must agree; returns the shared value.
fn uniform<T: Copy + PartialEq>(values: &[T]) -> Option<T> {
    let first = *values.first()?;
    values.iter().all(|&v| v == first).then_some(first)
}

impl ImageDirectory {
    pub fn from_ifd(tags: &TagReader<'_>) -> CogResult<Self> {
        let width: usize = narrow(TAG_IMAGE_WIDTH, tags.require_u64(TAG_IMAGE_WIDTH)?)?;
        let height: usize = narrow(TAG_IMAGE_LENGTH, tags.require_u64(TAG_IMAGE_LENGTH)?)?;
        if width == 0 || height == 0 {
            return Err(CogError::InvalidTiff(format!("empty image {width}x{height}")));
        }
        let bands: usize = narrow(
            TAG_SAMPLES_PER_PIXEL,
            tags.find_u64(TAG_SAMPLES_PER_PIXEL)?.unwrap_or(1),
        )?;
        if bands == 0 {
            return Err(CogError::InvalidTiff("SamplesPerPixel is 0".into()));
        }

        let photometric = PhotometricInterpretation::from_u16(narrow(
            TAG_PHOTOMETRIC_INTERPRETATION,
            tags.find_u64(TAG_PHOTOMETRIC_INTERPRETATION)?.unwrap_or(1),
        )?);
        let bits: Vec<u8> = tags
            .find_u64s(TAG_BITS_PER_SAMPLE)?
            .unwrap_or_else(|| vec![1])
            .into_iter()
            .map(|b| narrow(TAG_BITS_PER_SAMPLE, b))
            .collect::<CogResult<_>>()?;
        let bits_per_sample = resolve_pixel_encoding(photometric, bands, &bits)?;

        let formats: Vec<SampleFormat> = tags
            .find_u64s(TAG_SAMPLE_FORMAT)?
            .unwrap_or_else(|| vec![1])
            .into_iter()
            .map(|f| narrow(TAG_SAMPLE_FORMAT, f).map(SampleFormat::from_u16))
            .collect::<CogResult<_>>()?;
        let sample_format = match uniform(&formats) {
            Some(format @ (SampleFormat::Uint | SampleFormat::Int | SampleFormat::IEEEFP)) => format,
            _ => return Err(UnsupportedFormat::SampleFormat(formats).into()),
        };
        let data_type = CogDataType::from_format(sample_format, bits_per_sample)
            .ok_or(UnsupportedFormat::SampleFormatWithBits(sample_format, bits_per_sample))?;

        let compression = Compression::from_method(CompressionMethod::from_u16(narrow(
            TAG_COMPRESSION,
            tags.find_u64(TAG_COMPRESSION)?.unwrap_or(1),
        )?))?;
        let predictor = Predictor::from_tag(
            narrow(TAG_PREDICTOR, tags.find_u64(TAG_PREDICTOR)?.unwrap_or(1))?,
            sample_format,
        )?;
        let planar = match tags.find_u64(TAG_PLANAR_CONFIGURATION)?.unwrap_or(1) {
            1 => PlanarConfiguration::Chunky,
            2 => PlanarConfiguration::Planar,
            other => {
                return Err(UnsupportedFormat::PlanarConfiguration(narrow(
                    TAG_PLANAR_CONFIGURATION,
                    other,
                )?)
                .into());
            }
        };

        let (layout, tile_offsets, tile_byte_counts) = if tags.ifd.entry(TAG_TILE_WIDTH).is_some() {
            let tile_width = narrow(TAG_TILE_WIDTH, tags.require_u64(TAG_TILE_WIDTH)?)?;
            let tile_height = narrow(TAG_TILE_LENGTH, tags.require_u64(TAG_TILE_LENGTH)?)?;
            (
                ChunkLayout::Tiled {
                    tile_width,
                    tile_height,
                },
                tags.require_u64s(TAG_TILE_OFFSETS)?,
                tags.require_u64s(TAG_TILE_BYTE_COUNTS)?,
            )
        } else if tags.ifd.entry(TAG_STRIP_OFFSETS).is_some() {
            // RowsPerStrip defaults to 2^32 - 1, i.e. a single strip
            let rows_per_strip = tags
                .find_u64(TAG_ROWS_PER_STRIP)?
                .map_or(height, |rows| usize::try_from(rows).unwrap_or(usize::MAX).min(height));
            (
                ChunkLayout::Striped { rows_per_strip },
                tags.require_u64s(TAG_STRIP_OFFSETS)?,
                tags.require_u64s(TAG_STRIP_BYTE_COUNTS)?,
            )
        } else {
            return Err(CogError::InvalidTiff("TIFF has neither tile nor strip tags".into()));
        };

        let geo_keys = tags
            .find_u64s(TAG_GEO_KEY_DIRECTORY)?
            .map(|keys| GeoKeys::parse(&keys))
            .unwrap_or_default();
        let geo_transform = GeoTransform::from_tags(
            tags.find_f64s(TAG_MODEL_PIXEL_SCALE)?.as_deref(),
            tags.find_f64s(TAG_MODEL_TIEPOINT)?.as_deref(),
            tags.find_f64s(TAG_MODEL_TRANSFORMATION)?.as_deref(),
            geo_keys.raster_type,
        )?;
        let nodata = tags
            .find_ascii(TAG_GDAL_NODATA)?
            .and_then(|text| text.trim().parse::<f64>().ok());

        let directory = Self {
            width,
            height,
            bands,
            data_type,
            sample_format,
            photometric,
            bits_per_sample,
            compression,
            predictor,
            planar,
            layout,
            tile_offsets,
            tile_byte_counts,
            byte_order: tags.header.byte_order,
            geo_transform,
            geo_keys,
            nodata,
            subfile_type: tags.find_u64(TAG_NEW_SUBFILE_TYPE)?.unwrap_or(0),
        };
        directory.validate_layout()?;
        Ok(directory)
    }

    fn validate_layout(&self) -> CogResult<()> {
        let (chunk_width, chunk_height) = (self.chunk_width(), self.chunk_height());
        if chunk_width == 0 || chunk_height == 0 {
            return Err(CogError::InvalidTiff(format!(
                "invalid chunk size {chunk_width}x{chunk_height}"
            )));
        }
        let expected = self.number_of_tiles();
        if self.tile_offsets.len() != expected || self.tile_byte_counts.len() != expected {
            return Err(CogError::InvalidTiff(format!(
                "expected {expected} chunks, found {} offsets and {} byte counts",
                self.tile_offsets.len(),
                self.tile_byte_counts.len()
            )));
        }
        Ok(())
    }

    pub fn is_tiled(&self) -> bool {
        matches!(self.layout, ChunkLayout::Tiled { .. })
    }

    /// Width of a stored chunk (strips span the full image width)
    pub fn chunk_width(&self) -> usize {
        match self.layout {
            ChunkLayout::Tiled { tile_width, .. } => tile_width,
            ChunkLayout::Striped { .. } => self.width,
        }
    }

    /// Nominal height of a stored chunk
    pub fn chunk_height(&self) -> usize {
        match self.layout {
            ChunkLayout::Tiled { tile_height, .. } => tile_height,
            ChunkLayout::Striped { rows_per_strip } => rows_per_strip,
        }
    }

    pub fn tiles_across(&self) -> usize {
        self.width.div_ceil(self.chunk_width())
    }

    pub fn tiles_down(&self) -> usize {
        self.height.div_ceil(self.chunk_height())
    }

    /// Chunks per band plane (all chunks for chunky images)
    pub fn chunks_per_plane(&self) -> usize {
        self.tiles_across() * self.tiles_down()
    }

    pub fn number_of_tiles(&self) -> usize {
        match self.planar {
            PlanarConfiguration::Chunky => self.chunks_per_plane(),
            PlanarConfiguration::Planar => self.chunks_per_plane() * self.bands,
        }
    }

    /// Interleaved samples per pixel within one chunk
    pub fn samples_per_chunk_pixel(&self) -> usize {
        match self.planar {
            PlanarConfiguration::Chunky => self.bands,
            PlanarConfiguration::Planar => 1,
        }
    }

    /// Index into `tile_offsets` of the chunk at `(tile_row, tile_col)` holding
    /// `plane` (always 0 for chunky images).
    pub fn chunk_index(&self, tile_row: usize, tile_col: usize, plane: usize) -> usize {
        plane * self.chunks_per_plane() + tile_row * self.tiles_across() + tile_col
    }

    /// Rows actually stored in chunks of `tile_row`. Tiles are always full
    /// height, the last strip is clipped to the image.
    pub fn stored_rows(&self, tile_row: usize) -> usize {
        match self.layout {
            ChunkLayout::Tiled { tile_height, .. } => tile_height,
            ChunkLayout::Striped { rows_per_strip } => {
                rows_per_strip.min(self.height - tile_row * rows_per_strip)
            }
        }
    }

    /// Band planes stored separately: the band count for planar images, else 1.
    pub fn planes(&self) -> usize {
        match self.planar {
            PlanarConfiguration::Chunky => 1,
            PlanarConfiguration::Planar => self.bands,
        }
    }

    pub fn chunk_decoder(&self) -> ChunkDecoder {
        ChunkDecoder {
            compression: self.compression,
            predictor: self.predictor,
            byte_order: self.byte_order,
            data_type: self.data_type,
            samples_per_pixel: self.samples_per_chunk_pixel(),
            nodata: self.nodata,
        }
    }

    pub fn is_overview(&self) -> bool {
        self.subfile_type & SUBFILE_REDUCED_RESOLUTION != 0
    }

    pub fn epsg(&self) -> Option<u32> {
        self.geo_keys.epsg
    }

    /// Pixel-center coordinate axes of this directory's grid
    pub fn coordinates(&self) -> CogResult<CoordinateAxes> {
        self.geo_transform
            .ok_or_else(|| {
                CogError::from(UnsupportedFormat::GeoTransform(
                    "missing ModelPixelScale/ModelTiepoint tags".into(),
                ))
            })?
            .coordinates(self.width, self.height)
    }
}

/// Accept grayscale with any sample count and RGB with at least three, all
/// samples sharing one byte-aligned bit depth.
fn resolve_pixel_encoding(
    photometric: PhotometricInterpretation,
    bands: usize,
    bits: &[u8],
) -> Result<u8, UnsupportedFormat> {
    let unsupported = || UnsupportedFormat::InterpretationWithBits(photometric, bits.to_vec());
    let supported_color = match photometric {
        PhotometricInterpretation::WhiteIsZero | PhotometricInterpretation::BlackIsZero => true,
        PhotometricInterpretation::RGB => bands >= 3,
        PhotometricInterpretation::RGBPalette
        | PhotometricInterpretation::TransparencyMask
        | PhotometricInterpretation::CMYK
        | PhotometricInterpretation::YCbCr
        | PhotometricInterpretation::CIELab
        | PhotometricInterpretation::Unknown(_) => false,
    };
    if !supported_color {
        return Err(unsupported());
    }
    match uniform(bits) {
        Some(depth @ (8 | 16 | 32 | 64)) => Ok(depth),
        _ => Err(unsupported()),
    }
}

/// Parse the full-resolution directory and its overviews.
///
/// Overviews are the reduced-resolution IFDs that follow the first one; their
/// transform is derived from the full-resolution one. Mask IFDs are skipped.
/// An overview that cannot be parsed ends the walk without failing the open.
pub fn read_directories(
    source: &dyn RangeReader,
) -> CogResult<(TiffHeader, ImageDirectory, Vec<ImageDirectory>)> {
    let header = TiffHeader::read(source)?;
    let first = Ifd::read(source, &header, header.first_ifd_offset)?;
    let full = ImageDirectory::from_ifd(&TagReader {
        source,
        header: &header,
        ifd: &first,
    })?;
    debug!(
        source = %source.identifier(),
        width = full.width,
        height = full.height,
        bands = full.bands,
        dtype = ?full.data_type,
        compression = ?full.compression,
        tiled = full.is_tiled(),
        "Parsed image directory"
    );

    let mut overviews = Vec::new();
    let mut visited = HashSet::from([first.offset]);
    let mut next = first.next_ifd_offset;
    while next != 0 {
        if !visited.insert(next) {
            warn!(source = %source.identifier(), offset = next, "IFD chain loops, stopping");
            break;
        }
        let ifd = match Ifd::read(source, &header, next) {
            Ok(ifd) => ifd,
            Err(e) => {
                warn!(source = %source.identifier(), offset = next, error = %e, "Unreadable IFD, ignoring remaining overviews");
                break;
            }
        };
        next = ifd.next_ifd_offset;

        let tags = TagReader {
            source,
            header: &header,
            ifd: &ifd,
        };
        let subfile_type = tags.find_u64(TAG_NEW_SUBFILE_TYPE).ok().flatten().unwrap_or(0);
        if subfile_type & SUBFILE_MASK != 0 || subfile_type & SUBFILE_REDUCED_RESOLUTION == 0 {
            debug!(offset = ifd.offset, subfile_type, "Skipping non-overview IFD");
            continue;
        }

        match ImageDirectory::from_ifd(&tags) {
            Ok(mut overview) => {
                overview.geo_transform = full.geo_transform.map(|t| {
                    t.scaled(
                        full.width as f64 / overview.width as f64,
                        full.height as f64 / overview.height as f64,
                    )
                });
                overview.geo_keys = full.geo_keys;
                overviews.push(overview);
            }
            Err(e) => {
                warn!(source = %source.identifier(), offset = ifd.offset, error = %e, "Unusable overview IFD, ignoring remaining overviews");
                break;
            }
        }
    }
    overviews.sort_by(|a, b| b.width.cmp(&a.width));

    Ok((header, full, overviews))
}
