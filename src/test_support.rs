//! Test fixtures: an in-memory GeoTIFF writer, a jittery range reader and a
//! loopback HTTP server with range support.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use ndarray::Array3;
use tempfile::NamedTempFile;

use crate::codec::{Compression, read_uint, write_uint};
use crate::directory::ChunkLayout;
use crate::error::CogResult;
use crate::range_reader::{MemoryRangeReader, RangeReader};
use crate::raster::{CogDataType, Sample};
use crate::tiff_utils::*;

/// Inverse of the horizontal predictor, applied in place row by row.
pub fn encode_horizontal_predictor(
    data: &mut [u8],
    row_samples: usize,
    stride: usize,
    bytes_per_sample: usize,
    order: ByteOrder,
) {
    for row in data.chunks_exact_mut(row_samples * bytes_per_sample) {
        for i in (stride..row_samples).rev() {
            let cur = i * bytes_per_sample;
            let prev = (i - stride) * bytes_per_sample;
            let diff = read_uint(&row[cur..cur + bytes_per_sample], order)
                .wrapping_sub(read_uint(&row[prev..prev + bytes_per_sample], order));
            write_uint(&mut row[cur..cur + bytes_per_sample], diff, order);
        }
    }
}

/// Inverse of the floating point predictor: split each row into byte planes
/// (most significant first), then difference the bytes.
pub fn encode_floating_point_predictor(
    data: &mut [u8],
    row_samples: usize,
    stride: usize,
    bytes_per_sample: usize,
    order: ByteOrder,
) {
    for row in data.chunks_exact_mut(row_samples * bytes_per_sample) {
        let mut planes = vec![0u8; row.len()];
        for sample in 0..row_samples {
            for plane in 0..bytes_per_sample {
                let at = match order {
                    ByteOrder::BigEndian => plane,
                    ByteOrder::LittleEndian => bytes_per_sample - 1 - plane,
                };
                planes[plane * row_samples + sample] = row[sample * bytes_per_sample + at];
            }
        }
        for i in (stride..planes.len()).rev() {
            planes[i] = planes[i].wrapping_sub(planes[i - stride]);
        }
        row.copy_from_slice(&planes);
    }
}

fn encode_sample(data_type: CogDataType, value: f64, order: ByteOrder) -> Vec<u8> {
    macro_rules! bytes {
        ($t:ty) => {
            match order {
                ByteOrder::LittleEndian => (value as $t).to_le_bytes().to_vec(),
                ByteOrder::BigEndian => (value as $t).to_be_bytes().to_vec(),
            }
        };
    }
    match data_type {
        CogDataType::UInt8 => bytes!(u8),
        CogDataType::UInt16 => bytes!(u16),
        CogDataType::UInt32 => bytes!(u32),
        CogDataType::UInt64 => bytes!(u64),
        CogDataType::Int8 => bytes!(i8),
        CogDataType::Int16 => bytes!(i16),
        CogDataType::Int32 => bytes!(i32),
        CogDataType::Int64 => bytes!(i64),
        CogDataType::Float32 => bytes!(f32),
        CogDataType::Float64 => bytes!(f64),
    }
}

fn default_value(data_type: CogDataType, band: usize, y: usize, x: usize, width: usize) -> f64 {
    match data_type {
        CogDataType::Float32 | CogDataType::Float64 => {
            (band * 1000 + y * width + x) as f64 * 0.25 - 100.0
        }
        CogDataType::Int8 | CogDataType::Int16 | CogDataType::Int32 | CogDataType::Int64 => {
            ((band * 97 + y * 31 + x * 7) % 200) as f64 - 100.0
        }
        _ => ((band * 97 + y * 31 + x * 7) % 200) as f64,
    }
}

/// One image (IFD) of a fixture file
#[derive(Debug, Clone)]
pub struct ImageSpec {
    width: usize,
    height: usize,
    bands: usize,
    data_type: CogDataType,
    values: Vec<f64>,
    layout: ChunkLayout,
    planar: bool,
    compression: Compression,
    compression_tag: Option<u16>,
    predictor: u16,
    photometric: u16,
    sample_format: Option<u16>,
    pixel_scale: Option<[f64; 2]>,
    tiepoint: Option<[f64; 2]>,
    transformation: Option<[f64; 16]>,
    pixel_is_point: bool,
    epsg: Option<u16>,
    nodata: Option<String>,
    subfile_type: u32,
    sparse: Vec<usize>,
    corrupt: Vec<usize>,
    drop_last_chunk: bool,
}

impl ImageSpec {
    /// A single-strip, uncompressed, chunky image filled with a deterministic
    /// pattern.
    pub fn new(width: usize, height: usize, bands: usize, data_type: CogDataType) -> Self {
        let mut values = Vec::with_capacity(bands * height * width);
        for band in 0..bands {
            for y in 0..height {
                for x in 0..width {
                    values.push(default_value(data_type, band, y, x, width));
                }
            }
        }
        Self {
            width,
            height,
            bands,
            data_type,
            values,
            layout: ChunkLayout::Striped {
                rows_per_strip: height,
            },
            planar: false,
            compression: Compression::None,
            compression_tag: None,
            predictor: 1,
            photometric: 1,
            sample_format: None,
            pixel_scale: None,
            tiepoint: None,
            transformation: None,
            pixel_is_point: false,
            epsg: None,
            nodata: None,
            subfile_type: 0,
            sparse: Vec::new(),
            corrupt: Vec::new(),
            drop_last_chunk: false,
        }
    }

    /// Pixel values in CHW order
    pub fn values(mut self, values: Vec<f64>) -> Self {
        assert_eq!(values.len(), self.bands * self.height * self.width);
        self.values = values;
        self
    }

    pub fn tiled(mut self, tile_width: usize, tile_height: usize) -> Self {
        self.layout = ChunkLayout::Tiled {
            tile_width,
            tile_height,
        };
        self
    }

    pub fn striped(mut self, rows_per_strip: usize) -> Self {
        self.layout = ChunkLayout::Striped { rows_per_strip };
        self
    }

    pub fn planar(mut self) -> Self {
        self.planar = true;
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Write a raw `Compression` tag value (the data stays uncompressed).
    pub fn compression_tag(mut self, tag: u16) -> Self {
        self.compression_tag = Some(tag);
        self
    }

    pub fn predictor(mut self, predictor: u16) -> Self {
        self.predictor = predictor;
        self
    }

    pub fn photometric(mut self, photometric: u16) -> Self {
        self.photometric = photometric;
        self
    }

    pub fn sample_format(mut self, sample_format: u16) -> Self {
        self.sample_format = Some(sample_format);
        self
    }

    /// `ModelPixelScale` `[sx, sy]` and a tiepoint tying pixel (0, 0) to `[x, y]`
    pub fn geo(mut self, pixel_scale: [f64; 2], origin: [f64; 2]) -> Self {
        self.pixel_scale = Some(pixel_scale);
        self.tiepoint = Some(origin);
        self
    }

    pub fn transformation(mut self, matrix: [f64; 16]) -> Self {
        self.transformation = Some(matrix);
        self
    }

    pub fn pixel_is_point(mut self) -> Self {
        self.pixel_is_point = true;
        self
    }

    pub fn epsg(mut self, code: u16) -> Self {
        self.epsg = Some(code);
        self
    }

    pub fn nodata(mut self, nodata: &str) -> Self {
        self.nodata = Some(nodata.to_string());
        self
    }

    pub fn overview(mut self) -> Self {
        self.subfile_type = 1;
        self
    }

    pub fn mask(mut self) -> Self {
        self.subfile_type = 4;
        self
    }

    /// Store chunk `index` with a zero byte count.
    pub fn sparse_chunk(mut self, index: usize) -> Self {
        self.sparse.push(index);
        self
    }

    /// Replace the stored bytes of chunk `index` with garbage.
    pub fn corrupt_chunk(mut self, index: usize) -> Self {
        self.corrupt.push(index);
        self
    }

    pub fn drop_last_chunk(mut self) -> Self {
        self.drop_last_chunk = true;
        self
    }

    /// The array a correct decoder must produce
    pub fn expected<T: Sample>(&self) -> Array3<T> {
        Array3::from_shape_fn((self.bands, self.height, self.width), |(b, y, x)| {
            T::from_f64(self.values[(b * self.height + y) * self.width + x])
        })
    }

    fn chunk_size(&self) -> (usize, usize) {
        match self.layout {
            ChunkLayout::Tiled {
                tile_width,
                tile_height,
            } => (tile_width, tile_height),
            ChunkLayout::Striped { rows_per_strip } => (self.width, rows_per_strip.min(self.height)),
        }
    }

    fn encode_chunks(&self, order: ByteOrder) -> Vec<Vec<u8>> {
        let (chunk_width, chunk_height) = self.chunk_size();
        let across = self.width.div_ceil(chunk_width);
        let down = self.height.div_ceil(chunk_height);
        let (planes, samples_per_pixel) = if self.planar {
            (self.bands, 1)
        } else {
            (1, self.bands)
        };
        let bytes_per_sample = self.data_type.bytes_per_sample();

        let mut chunks = Vec::new();
        for plane in 0..planes {
            for row in 0..down {
                for col in 0..across {
                    let index = chunks.len();
                    let rows = match self.layout {
                        ChunkLayout::Tiled { .. } => chunk_height,
                        ChunkLayout::Striped { .. } => chunk_height.min(self.height - row * chunk_height),
                    };

                    let mut raw = Vec::new();
                    for y in 0..rows {
                        for x in 0..chunk_width {
                            for sample in 0..samples_per_pixel {
                                let band = if self.planar { plane } else { sample };
                                let (px, py) = (col * chunk_width + x, row * chunk_height + y);
                                let value = if px < self.width && py < self.height {
                                    self.values[(band * self.height + py) * self.width + px]
                                } else {
                                    0.0
                                };
                                raw.extend(encode_sample(self.data_type, value, order));
                            }
                        }
                    }

                    let row_samples = chunk_width * samples_per_pixel;
                    match self.predictor {
                        2 => encode_horizontal_predictor(
                            &mut raw,
                            row_samples,
                            samples_per_pixel,
                            bytes_per_sample,
                            order,
                        ),
                        3 => encode_floating_point_predictor(
                            &mut raw,
                            row_samples,
                            samples_per_pixel,
                            bytes_per_sample,
                            order,
                        ),
                        _ => {}
                    }

                    let stored = if self.sparse.contains(&index) {
                        Vec::new()
                    } else if self.corrupt.contains(&index) {
                        vec![0xFF; raw.len().clamp(8, 64)]
                    } else {
                        compress(self.compression, &raw)
                    };
                    chunks.push(stored);
                }
            }
        }
        chunks
    }

    fn geo_keys(&self) -> Option<Vec<u16>> {
        let georeferenced = self.pixel_scale.is_some() || self.transformation.is_some();
        if !georeferenced && self.epsg.is_none() {
            return None;
        }
        let mut keys: Vec<[u16; 4]> = vec![[1025, 0, 1, if self.pixel_is_point { 2 } else { 1 }]];
        match self.epsg {
            Some(code @ 4000..=4999) => keys.push([2048, 0, 1, code]),
            Some(code) => keys.push([3072, 0, 1, code]),
            None => {}
        }
        let mut directory = vec![1, 1, 0, keys.len() as u16];
        directory.extend(keys.into_iter().flatten());
        Some(directory)
    }

    fn tags(&self, chunks: &[(u64, u64)], big_tiff: bool) -> BTreeMap<u16, TagValue> {
        let bits = (self.data_type.bytes_per_sample() * 8) as u16;
        let format = self.sample_format.unwrap_or(match self.data_type {
            CogDataType::Float32 | CogDataType::Float64 => 3,
            CogDataType::Int8 | CogDataType::Int16 | CogDataType::Int32 | CogDataType::Int64 => 2,
            _ => 1,
        });
        let compression = self.compression_tag.unwrap_or(match self.compression {
            Compression::None => 1,
            Compression::Deflate => 8,
            Compression::Zstd => 50000,
        });

        let mut chunks = chunks.to_vec();
        if self.drop_last_chunk {
            chunks.pop();
        }
        let offsets: Vec<u64> = chunks.iter().map(|&(offset, _)| offset).collect();
        let counts: Vec<u64> = chunks.iter().map(|&(_, count)| count).collect();
        let pointers = |values: Vec<u64>| {
            if big_tiff {
                TagValue::Long8(values)
            } else {
                TagValue::Long(values.into_iter().map(|v| v as u32).collect())
            }
        };

        let mut tags = BTreeMap::new();
        if self.subfile_type != 0 {
            tags.insert(TAG_NEW_SUBFILE_TYPE, TagValue::Long(vec![self.subfile_type]));
        }
        tags.insert(TAG_IMAGE_WIDTH, TagValue::Long(vec![self.width as u32]));
        tags.insert(TAG_IMAGE_LENGTH, TagValue::Long(vec![self.height as u32]));
        tags.insert(TAG_BITS_PER_SAMPLE, TagValue::Short(vec![bits; self.bands]));
        tags.insert(TAG_COMPRESSION, TagValue::Short(vec![compression]));
        tags.insert(TAG_PHOTOMETRIC_INTERPRETATION, TagValue::Short(vec![self.photometric]));
        tags.insert(TAG_SAMPLES_PER_PIXEL, TagValue::Short(vec![self.bands as u16]));
        tags.insert(
            TAG_PLANAR_CONFIGURATION,
            TagValue::Short(vec![if self.planar { 2 } else { 1 }]),
        );
        if self.predictor != 1 {
            tags.insert(TAG_PREDICTOR, TagValue::Short(vec![self.predictor]));
        }
        tags.insert(TAG_SAMPLE_FORMAT, TagValue::Short(vec![format; self.bands]));

        match self.layout {
            ChunkLayout::Tiled {
                tile_width,
                tile_height,
            } => {
                tags.insert(TAG_TILE_WIDTH, TagValue::Long(vec![tile_width as u32]));
                tags.insert(TAG_TILE_LENGTH, TagValue::Long(vec![tile_height as u32]));
                tags.insert(TAG_TILE_OFFSETS, pointers(offsets));
                tags.insert(TAG_TILE_BYTE_COUNTS, pointers(counts));
            }
            ChunkLayout::Striped { rows_per_strip } => {
                tags.insert(TAG_ROWS_PER_STRIP, TagValue::Long(vec![rows_per_strip as u32]));
                tags.insert(TAG_STRIP_OFFSETS, pointers(offsets));
                tags.insert(TAG_STRIP_BYTE_COUNTS, pointers(counts));
            }
        }

        if let (Some([sx, sy]), Some([x, y])) = (self.pixel_scale, self.tiepoint) {
            tags.insert(TAG_MODEL_PIXEL_SCALE, TagValue::Double(vec![sx, sy, 0.0]));
            tags.insert(
                TAG_MODEL_TIEPOINT,
                TagValue::Double(vec![0.0, 0.0, 0.0, x, y, 0.0]),
            );
        }
        if let Some(matrix) = self.transformation {
            tags.insert(TAG_MODEL_TRANSFORMATION, TagValue::Double(matrix.to_vec()));
        }
        if let Some(keys) = self.geo_keys() {
            tags.insert(TAG_GEO_KEY_DIRECTORY, TagValue::Short(keys));
        }
        if let Some(nodata) = &self.nodata {
            tags.insert(TAG_GDAL_NODATA, TagValue::Ascii(nodata.clone()));
        }
        tags
    }
}

fn compress(compression: Compression, raw: &[u8]) -> Vec<u8> {
    match compression {
        Compression::None => raw.to_vec(),
        Compression::Deflate => {
            let mut encoder =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(raw).expect("in-memory deflate");
            encoder.finish().expect("in-memory deflate")
        }
        Compression::Zstd => zstd::encode_all(raw, 3).expect("in-memory zstd"),
    }
}

#[derive(Debug, Clone)]
enum TagValue {
    Short(Vec<u16>),
    Long(Vec<u32>),
    Long8(Vec<u64>),
    Double(Vec<f64>),
    Ascii(String),
}

impl TagValue {
    fn field_type(&self) -> u16 {
        match self {
            TagValue::Short(_) => 3,
            TagValue::Long(_) => 4,
            TagValue::Long8(_) => 16,
            TagValue::Double(_) => 12,
            TagValue::Ascii(_) => 2,
        }
    }

    fn count(&self) -> u64 {
        match self {
            TagValue::Short(v) => v.len() as u64,
            TagValue::Long(v) => v.len() as u64,
            TagValue::Long8(v) => v.len() as u64,
            TagValue::Double(v) => v.len() as u64,
            TagValue::Ascii(s) => s.len() as u64 + 1,
        }
    }

    fn bytes(&self, order: ByteOrder) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            TagValue::Short(values) => values.iter().for_each(|&v| put(&mut out, u64::from(v), 2, order)),
            TagValue::Long(values) => values.iter().for_each(|&v| put(&mut out, u64::from(v), 4, order)),
            TagValue::Long8(values) => values.iter().for_each(|&v| put(&mut out, v, 8, order)),
            TagValue::Double(values) => values.iter().for_each(|&v| put(&mut out, v.to_bits(), 8, order)),
            TagValue::Ascii(text) => {
                out.extend_from_slice(text.as_bytes());
                out.push(0);
            }
        }
        out
    }
}

fn put(out: &mut Vec<u8>, value: u64, size: usize, order: ByteOrder) {
    let start = out.len();
    out.resize(start + size, 0);
    write_uint(&mut out[start..], value, order);
}

/// Assembles a TIFF file from [`ImageSpec`]s, one IFD per image in order.
#[derive(Debug, Clone)]
pub struct TiffBuilder {
    byte_order: ByteOrder,
    big_tiff: bool,
    images: Vec<ImageSpec>,
}

impl TiffBuilder {
    pub fn new() -> Self {
        Self {
            byte_order: ByteOrder::LittleEndian,
            big_tiff: false,
            images: Vec::new(),
        }
    }

    pub fn byte_order(mut self, order: ByteOrder) -> Self {
        self.byte_order = order;
        self
    }

    pub fn big_tiff(mut self) -> Self {
        self.big_tiff = true;
        self
    }

    pub fn image(mut self, image: ImageSpec) -> Self {
        self.images.push(image);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let order = self.byte_order;
        let (count_size, entry_size, offset_size) = if self.big_tiff {
            (8, 20, 8)
        } else {
            (2, 12, 4)
        };

        let mut out = match order {
            ByteOrder::LittleEndian => b"II".to_vec(),
            ByteOrder::BigEndian => b"MM".to_vec(),
        };
        if self.big_tiff {
            put(&mut out, 43, 2, order);
            put(&mut out, 8, 2, order);
            put(&mut out, 0, 2, order);
        } else {
            put(&mut out, 42, 2, order);
        }
        let mut pointer_at = out.len();
        put(&mut out, 0, offset_size, order);

        // pixel data first, directories at the end
        let mut placements = Vec::new();
        for image in &self.images {
            let mut chunks = Vec::new();
            for chunk in image.encode_chunks(order) {
                chunks.push((out.len() as u64, chunk.len() as u64));
                out.extend(chunk);
            }
            placements.push(chunks);
        }

        for (image, chunks) in self.images.iter().zip(&placements) {
            if out.len() % 2 == 1 {
                out.push(0);
            }
            let ifd_offset = out.len();
            write_uint(
                &mut out[pointer_at..pointer_at + offset_size],
                ifd_offset as u64,
                order,
            );

            let tags = image.tags(chunks, self.big_tiff);
            let ool_start = ifd_offset + count_size + tags.len() * entry_size + offset_size;
            let mut ifd = Vec::new();
            let mut ool = Vec::new();
            put(&mut ifd, tags.len() as u64, count_size, order);
            for (&tag, value) in &tags {
                put(&mut ifd, u64::from(tag), 2, order);
                put(&mut ifd, u64::from(value.field_type()), 2, order);
                put(&mut ifd, value.count(), if self.big_tiff { 8 } else { 4 }, order);
                let mut bytes = value.bytes(order);
                if bytes.len() <= offset_size {
                    bytes.resize(offset_size, 0);
                    ifd.extend(bytes);
                } else {
                    put(&mut ifd, (ool_start + ool.len()) as u64, offset_size, order);
                    ool.extend(bytes);
                    if ool.len() % 2 == 1 {
                        ool.push(0);
                    }
                }
            }
            pointer_at = ifd_offset + ifd.len();
            put(&mut ifd, 0, offset_size, order);
            out.extend(ifd);
            out.extend(ool);
        }
        out
    }
}

/// Write `bytes` to a temporary `.tif` file.
pub fn write_temp(bytes: &[u8]) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".tif")
        .tempfile()
        .expect("create temp file");
    file.write_all(bytes).expect("write temp file");
    file.flush().expect("flush temp file");
    file
}

/// In-memory reader that sleeps a few offset-dependent milliseconds per read,
/// so concurrent chunk fetches finish out of order.
pub struct JitterReader {
    inner: MemoryRangeReader,
}

impl JitterReader {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            inner: MemoryRangeReader::new(bytes, "jitter"),
        }
    }
}

impl RangeReader for JitterReader {
    fn read_range(&self, offset: u64, length: usize) -> CogResult<Bytes> {
        let delay = (offset.wrapping_mul(2_654_435_761) >> 7) % 4;
        thread::sleep(Duration::from_millis(delay));
        self.inner.read_range(offset, length)
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn identifier(&self) -> &str {
        self.inner.identifier()
    }
}

/// Loopback HTTP/1.1 server publishing one file as `/raster.tif`.
///
/// Every other path is a 404. With `honor_range` off the server ignores
/// `Range` headers and always answers with the full body.
pub struct HttpFixture {
    base: String,
    served: Arc<AtomicUsize>,
}

#[derive(Clone, Copy)]
struct Behavior {
    honor_range: bool,
    allow_head: bool,
}

impl HttpFixture {
    pub fn serve(data: Vec<u8>, honor_range: bool) -> Self {
        Self::start(data, Behavior { honor_range, allow_head: true })
    }

    /// Like [`HttpFixture::serve`], but every `HEAD` gets `405 Method Not Allowed`.
    pub fn serve_without_head(data: Vec<u8>, honor_range: bool) -> Self {
        Self::start(data, Behavior { honor_range, allow_head: false })
    }

    fn start(data: Vec<u8>, behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
        let base = format!("http://{}", listener.local_addr().expect("local addr"));
        let data = Arc::new(data);
        let served = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&served);
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let data = Arc::clone(&data);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    let _ = respond(stream, &data, behavior, &counter);
                });
            }
        });
        Self { base, served }
    }

    pub fn url(&self, name: &str) -> String {
        format!("{}/{name}", self.base)
    }

    /// Body bytes written so far, over all requests.
    pub fn bytes_served(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }
}

fn parse_range(value: &str) -> Option<(usize, usize)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    Some((start.trim().parse().ok()?, end.trim().parse().ok()?))
}

fn respond(
    mut stream: TcpStream,
    data: &[u8],
    behavior: Behavior,
    served: &AtomicUsize,
) -> std::io::Result<()> {
    let honor_range = behavior.honor_range;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;
    let mut range = None;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 || line == "\r\n" {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("range") {
                range = parse_range(value.trim());
            }
        }
    }

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let path = parts.next().unwrap_or_default();
    let total = data.len();
    let (status, body, extra) = match range {
        _ if path != "/raster.tif" => ("404 Not Found", &data[..0], String::new()),
        _ if method == "HEAD" && !behavior.allow_head => {
            ("405 Method Not Allowed", &data[..0], String::new())
        }
        Some((start, _)) if honor_range && start >= total => (
            "416 Range Not Satisfiable",
            &data[..0],
            format!("Content-Range: bytes */{total}\r\n"),
        ),
        Some((start, end)) if honor_range => {
            let end = end.min(total - 1);
            (
                "206 Partial Content",
                &data[start..=end],
                format!("Content-Range: bytes {start}-{end}/{total}\r\n"),
            )
        }
        _ => ("200 OK", data, String::new()),
    };

    let head = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\n{extra}Connection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes())?;
    if method != "HEAD" {
        // counted before the write so clients never observe a stale total
        served.fetch_add(body.len(), Ordering::SeqCst);
        stream.write_all(body)?;
    }
    stream.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::read_directories;

    #[test]
    fn test_builder_pads_edge_tiles() {
        let image = ImageSpec::new(9, 5, 1, CogDataType::Float32)
            .tiled(16, 16)
            .predictor(3);
        let bytes = TiffBuilder::new().image(image).build();
        let (_, directory, _) =
            read_directories(&MemoryRangeReader::new(bytes, "memory")).unwrap();
        assert_eq!(directory.chunk_width(), 16);
        assert_eq!(directory.tile_byte_counts, vec![16 * 16 * 4]);
    }
}
