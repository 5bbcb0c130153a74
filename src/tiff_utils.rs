//! Low-level TIFF structures: header, IFD entries and tag values
//!
//! Classic TIFF and BigTIFF in either byte order. All reads go through a
//! [`RangeReader`], so nothing here assumes the file is local.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::error::{CogError, CogResult};
use crate::range_reader::RangeReader;

pub const TAG_NEW_SUBFILE_TYPE: u16 = 254;
pub const TAG_IMAGE_WIDTH: u16 = 256;
pub const TAG_IMAGE_LENGTH: u16 = 257;
pub const TAG_BITS_PER_SAMPLE: u16 = 258;
pub const TAG_COMPRESSION: u16 = 259;
pub const TAG_PHOTOMETRIC_INTERPRETATION: u16 = 262;
pub const TAG_STRIP_OFFSETS: u16 = 273;
pub const TAG_SAMPLES_PER_PIXEL: u16 = 277;
pub const TAG_ROWS_PER_STRIP: u16 = 278;
pub const TAG_STRIP_BYTE_COUNTS: u16 = 279;
pub const TAG_PLANAR_CONFIGURATION: u16 = 284;
pub const TAG_PREDICTOR: u16 = 317;
pub const TAG_TILE_WIDTH: u16 = 322;
pub const TAG_TILE_LENGTH: u16 = 323;
pub const TAG_TILE_OFFSETS: u16 = 324;
pub const TAG_TILE_BYTE_COUNTS: u16 = 325;
pub const TAG_SAMPLE_FORMAT: u16 = 339;
pub const TAG_MODEL_PIXEL_SCALE: u16 = 33550;
pub const TAG_MODEL_TIEPOINT: u16 = 33922;
pub const TAG_MODEL_TRANSFORMATION: u16 = 34264;
pub const TAG_GEO_KEY_DIRECTORY: u16 = 34735;
pub const TAG_GDAL_NODATA: u16 = 42113;

/// Byte order declared by the `II`/`MM` signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}

impl ByteOrder {
    pub fn u16(self, bytes: [u8; 2]) -> u16 {
        match self {
            Self::LittleEndian => u16::from_le_bytes(bytes),
            Self::BigEndian => u16::from_be_bytes(bytes),
        }
    }

    pub fn u32(self, bytes: [u8; 4]) -> u32 {
        match self {
            Self::LittleEndian => u32::from_le_bytes(bytes),
            Self::BigEndian => u32::from_be_bytes(bytes),
        }
    }

    pub fn u64(self, bytes: [u8; 8]) -> u64 {
        match self {
            Self::LittleEndian => u64::from_le_bytes(bytes),
            Self::BigEndian => u64::from_be_bytes(bytes),
        }
    }

    pub fn f32(self, bytes: [u8; 4]) -> f32 {
        f32::from_bits(self.u32(bytes))
    }

    pub fn f64(self, bytes: [u8; 8]) -> f64 {
        f64::from_bits(self.u64(bytes))
    }
}

/// Copy `N` bytes starting at `at`, failing on truncated input.
pub(crate) fn take<const N: usize>(bytes: &[u8], at: usize) -> CogResult<[u8; N]> {
    at.checked_add(N)
        .and_then(|end| bytes.get(at..end))
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| CogError::InvalidTiff(format!("unexpected end of data at byte {at}")))
}

/// Classic TIFF (version 42) or BigTIFF (version 43)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TiffVariant {
    Classic,
    Big,
}

impl TiffVariant {
    fn count_size(self) -> usize {
        match self {
            Self::Classic => 2,
            Self::Big => 8,
        }
    }

    fn entry_size(self) -> usize {
        match self {
            Self::Classic => 12,
            Self::Big => 20,
        }
    }

    fn offset_size(self) -> usize {
        match self {
            Self::Classic => 4,
            Self::Big => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TiffHeader {
    pub byte_order: ByteOrder,
    pub variant: TiffVariant,
    pub first_ifd_offset: u64,
}

impl TiffHeader {
    pub fn read(source: &dyn RangeReader) -> CogResult<Self> {
        let bytes = source.read_range(0, 8)?;
        let byte_order = match take::<2>(&bytes, 0)? {
            [b'I', b'I'] => ByteOrder::LittleEndian,
            [b'M', b'M'] => ByteOrder::BigEndian,
            _ => return Err(CogError::InvalidTiff("invalid TIFF signature".into())),
        };

        match byte_order.u16(take(&bytes, 2)?) {
            42 => Ok(Self {
                byte_order,
                variant: TiffVariant::Classic,
                first_ifd_offset: u64::from(byte_order.u32(take(&bytes, 4)?)),
            }),
            43 => {
                // BigTIFF: offset size (8), reserved zero, then an 8 byte offset
                if byte_order.u16(take(&bytes, 4)?) != 8 {
                    return Err(CogError::InvalidTiff("unsupported BigTIFF offset size".into()));
                }
                let offset = source.read_range(8, 8)?;
                Ok(Self {
                    byte_order,
                    variant: TiffVariant::Big,
                    first_ifd_offset: byte_order.u64(take(&offset, 0)?),
                })
            }
            version => Err(CogError::InvalidTiff(format!("invalid TIFF version {version}"))),
        }
    }

    fn read_offset(&self, bytes: &[u8], at: usize) -> CogResult<u64> {
        match self.variant {
            TiffVariant::Classic => Ok(u64::from(self.byte_order.u32(take(bytes, at)?))),
            TiffVariant::Big => Ok(self.byte_order.u64(take(bytes, at)?)),
        }
    }
}

/// Size in bytes of one value of a TIFF field type
fn field_type_size(field_type: u16) -> Option<usize> {
    match field_type {
        1 | 2 | 6 | 7 => Some(1),
        3 | 8 => Some(2),
        4 | 9 | 11 | 13 => Some(4),
        5 | 10 | 12 | 16 | 17 | 18 => Some(8),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct IfdEntry {
    pub tag: u16,
    pub field_type: u16,
    pub count: u64,
    /// Raw value/offset field, left-justified, 4 or 8 bytes used
    value: [u8; 8],
}

impl IfdEntry {
    fn byte_len(&self) -> CogResult<usize> {
        let size = field_type_size(self.field_type).ok_or_else(|| {
            CogError::InvalidTiff(format!(
                "tag {} has unknown field type {}",
                self.tag, self.field_type
            ))
        })?;
        usize::try_from(self.count)
            .ok()
            .and_then(|count| count.checked_mul(size))
            .ok_or_else(|| CogError::InvalidTiff(format!("tag {} count overflows", self.tag)))
    }

    /// The entry's value bytes, inline or fetched from the offset they point to.
    pub fn raw_bytes(&self, source: &dyn RangeReader, header: &TiffHeader) -> CogResult<Bytes> {
        let len = self.byte_len()?;
        if len <= header.variant.offset_size() {
            return Ok(Bytes::copy_from_slice(&self.value[..len]));
        }
        let offset = header.read_offset(&self.value, 0)?;
        source.read_range(offset, len)
    }

    pub fn u64_values(&self, source: &dyn RangeReader, header: &TiffHeader) -> CogResult<Vec<u64>> {
        let bytes = self.raw_bytes(source, header)?;
        let order = header.byte_order;
        match self.field_type {
            1 | 7 => Ok(bytes.iter().map(|&b| u64::from(b)).collect()),
            3 => bytes
                .chunks_exact(2)
                .map(|c| take(c, 0).map(|b| u64::from(order.u16(b))))
                .collect(),
            4 | 13 => bytes
                .chunks_exact(4)
                .map(|c| take(c, 0).map(|b| u64::from(order.u32(b))))
                .collect(),
            16 | 18 => bytes
                .chunks_exact(8)
                .map(|c| take(c, 0).map(|b| order.u64(b)))
                .collect(),
            other => Err(CogError::InvalidTiff(format!(
                "tag {} has non-integer field type {other}",
                self.tag
            ))),
        }
    }

    pub fn f64_values(&self, source: &dyn RangeReader, header: &TiffHeader) -> CogResult<Vec<f64>> {
        let order = header.byte_order;
        match self.field_type {
            11 => {
                let bytes = self.raw_bytes(source, header)?;
                bytes
                    .chunks_exact(4)
                    .map(|c| take(c, 0).map(|b| f64::from(order.f32(b))))
                    .collect()
            }
            12 => {
                let bytes = self.raw_bytes(source, header)?;
                bytes
                    .chunks_exact(8)
                    .map(|c| take(c, 0).map(|b| order.f64(b)))
                    .collect()
            }
            _ => Ok(self
                .u64_values(source, header)?
                .into_iter()
                .map(|v| v as f64)
                .collect()),
        }
    }

    pub fn ascii(&self, source: &dyn RangeReader, header: &TiffHeader) -> CogResult<String> {
        let bytes = self.raw_bytes(source, header)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }
}

/// One image file directory and the offset of the next one (0 ends the chain)
#[derive(Debug, Clone)]
pub struct Ifd {
    pub offset: u64,
    pub entries: BTreeMap<u16, IfdEntry>,
    pub next_ifd_offset: u64,
}

impl Ifd {
    pub fn read(source: &dyn RangeReader, header: &TiffHeader, offset: u64) -> CogResult<Self> {
        let variant = header.variant;
        let order = header.byte_order;

        let count_bytes = source.read_range(offset, variant.count_size())?;
        let entry_count = match variant {
            TiffVariant::Classic => u64::from(order.u16(take(&count_bytes, 0)?)),
            TiffVariant::Big => order.u64(take(&count_bytes, 0)?),
        };
        let entry_count = usize::try_from(entry_count)
            .ok()
            .filter(|&n| n <= u16::MAX as usize)
            .ok_or_else(|| CogError::InvalidTiff(format!("IFD at {offset} has {entry_count} entries")))?;

        let body_len = entry_count * variant.entry_size() + variant.offset_size();
        let body = source.read_range(offset + variant.count_size() as u64, body_len)?;

        let mut entries = BTreeMap::new();
        for raw in body[..entry_count * variant.entry_size()].chunks_exact(variant.entry_size()) {
            let tag = order.u16(take(raw, 0)?);
            let field_type = order.u16(take(raw, 2)?);
            let (count, value_at) = match variant {
                TiffVariant::Classic => (u64::from(order.u32(take(raw, 4)?)), 8),
                TiffVariant::Big => (order.u64(take(raw, 4)?), 12),
            };
            let mut value = [0u8; 8];
            let value_len = variant.offset_size();
            value[..value_len].copy_from_slice(&raw[value_at..value_at + value_len]);
            entries.insert(
                tag,
                IfdEntry {
                    tag,
                    field_type,
                    count,
                    value,
                },
            );
        }

        let next_ifd_offset = header.read_offset(&body, entry_count * variant.entry_size())?;
        Ok(Self {
            offset,
            entries,
            next_ifd_offset,
        })
    }

    pub fn entry(&self, tag: u16) -> Option<&IfdEntry> {
        self.entries.get(&tag)
    }
}

/// Typed tag lookups against one IFD
pub struct TagReader<'a> {
    pub source: &'a dyn RangeReader,
    pub header: &'a TiffHeader,
    pub ifd: &'a Ifd,
}

impl TagReader<'_> {
    pub fn find_u64s(&self, tag: u16) -> CogResult<Option<Vec<u64>>> {
        self.ifd
            .entry(tag)
            .map(|entry| entry.u64_values(self.source, self.header))
            .transpose()
    }

    pub fn require_u64s(&self, tag: u16) -> CogResult<Vec<u64>> {
        self.find_u64s(tag)?
            .ok_or_else(|| CogError::InvalidTiff(format!("required tag {tag} not found")))
    }

    pub fn find_u64(&self, tag: u16) -> CogResult<Option<u64>> {
        Ok(self.find_u64s(tag)?.and_then(|values| values.first().copied()))
    }

    pub fn require_u64(&self, tag: u16) -> CogResult<u64> {
        self.require_u64s(tag)?
            .first()
            .copied()
            .ok_or_else(|| CogError::InvalidTiff(format!("tag {tag} has no value")))
    }

    pub fn find_f64s(&self, tag: u16) -> CogResult<Option<Vec<f64>>> {
        self.ifd
            .entry(tag)
            .map(|entry| entry.f64_values(self.source, self.header))
            .transpose()
    }

    pub fn find_ascii(&self, tag: u16) -> CogResult<Option<String>> {
        self.ifd
            .entry(tag)
            .map(|entry| entry.ascii(self.source, self.header))
            .transpose()
    }
}

/// `PhotometricInterpretation` tag values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhotometricInterpretation {
    WhiteIsZero,
    BlackIsZero,
    RGB,
    RGBPalette,
    TransparencyMask,
    CMYK,
    YCbCr,
    CIELab,
    Unknown(u16),
}

impl PhotometricInterpretation {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => Self::WhiteIsZero,
            1 => Self::BlackIsZero,
            2 => Self::RGB,
            3 => Self::RGBPalette,
            4 => Self::TransparencyMask,
            5 => Self::CMYK,
            6 => Self::YCbCr,
            8 => Self::CIELab,
            other => Self::Unknown(other),
        }
    }
}

/// `SampleFormat` tag values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    Uint,
    Int,
    IEEEFP,
    Void,
    Unknown(u16),
}

impl SampleFormat {
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => Self::Uint,
            2 => Self::Int,
            3 => Self::IEEEFP,
            4 => Self::Void,
            other => Self::Unknown(other),
        }
    }
}

/// `Compression` tag values as written by common encoders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    None,
    Huffman,
    Fax3,
    Fax4,
    LZW,
    OldJPEG,
    JPEG,
    Deflate,
    PackBits,
    OldDeflate,
    LERC,
    ZSTD,
    WebP,
    JPEGXL,
    Unknown(u16),
}

impl CompressionMethod {
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => Self::None,
            2 => Self::Huffman,
            3 => Self::Fax3,
            4 => Self::Fax4,
            5 => Self::LZW,
            6 => Self::OldJPEG,
            7 => Self::JPEG,
            8 => Self::Deflate,
            32773 => Self::PackBits,
            32946 => Self::OldDeflate,
            34887 => Self::LERC,
            50000 => Self::ZSTD,
            50001 => Self::WebP,
            50002 => Self::JPEGXL,
            other => Self::Unknown(other),
        }
    }
}
