//! Range-based reader interface for COG files
//!
//! A COG is laid out so that the header, the IFDs and every tile can be fetched
//! with independent byte-range reads. Everything above this module only ever asks
//! for `(offset, length)` pairs, so the same decoding code serves local files,
//! HTTP(S) servers and in-memory buffers.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, HeaderName, RANGE};
use tracing::{debug, trace, warn};
use url::Url;

use crate::config::ReaderConfig;
use crate::error::{CogError, CogResult};
use crate::path::RasterLocation;

/// Trait for reading byte ranges from any source
///
/// Implementations must allow concurrent calls from the decode workers.
pub trait RangeReader: Send + Sync {
    /// Read exactly `length` bytes starting at `offset`
    fn read_range(&self, offset: u64, length: usize) -> CogResult<Bytes>;

    /// Total size of the source in bytes (0 when the server does not report it)
    fn size(&self) -> u64;

    /// Human-readable identifier for logging and errors
    fn identifier(&self) -> &str;

    /// Whether reads are cheap (local disk or memory) or go over the network
    fn is_local(&self) -> bool {
        let id = self.identifier();
        !id.starts_with("http://") && !id.starts_with("https://")
    }
}

fn short_read(identifier: &str, offset: u64, wanted: usize, got: usize) -> CogError {
    CogError::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("{identifier}: wanted {wanted} bytes at offset {offset}, got {got}"),
    ))
}

/// `length` bytes of `body` at `offset`, or a short read error.
fn slice_body(identifier: &str, body: &Bytes, offset: u64, length: usize) -> CogResult<Bytes> {
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(body.len());
    let available = body.len() - start;
    if available < length {
        return Err(short_read(identifier, offset, length, available));
    }
    Ok(body.slice(start..start + length))
}

/// Local file range reader
///
/// The file handle is opened once and shared; reads use positioned I/O so
/// concurrent workers never contend on a seek cursor.
pub struct LocalRangeReader {
    path: PathBuf,
    identifier: String,
    file: File,
    size: u64,
}

impl LocalRangeReader {
    pub fn new(path: impl AsRef<Path>) -> CogResult<Self> {
        let path = path.as_ref().to_path_buf();
        let identifier = path.display().to_string();
        let file = File::open(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => CogError::FileNotFound(identifier.clone()),
            _ => CogError::Io(e),
        })?;
        let size = file.metadata()?.len();
        debug!(path = %identifier, size, "Opened local raster");
        Ok(Self {
            path,
            identifier,
            file,
            size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(unix)]
    fn read_at(&self, buffer: &mut [u8], offset: u64) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buffer, offset)
    }

    #[cfg(not(unix))]
    fn read_at(&self, buffer: &mut [u8], offset: u64) -> io::Result<()> {
        use std::io::{Read, Seek, SeekFrom};
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buffer)
    }
}

impl RangeReader for LocalRangeReader {
    fn read_range(&self, offset: u64, length: usize) -> CogResult<Bytes> {
        if length == 0 {
            return Ok(Bytes::new());
        }
        let available = self.size.saturating_sub(offset);
        if (length as u64) > available {
            return Err(short_read(&self.identifier, offset, length, available as usize));
        }
        let mut buffer = vec![0u8; length];
        self.read_at(&mut buffer, offset)?;
        Ok(Bytes::from(buffer))
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn is_local(&self) -> bool {
        true
    }
}

/// HTTP range reader for remote COG files
/// Uses the reqwest blocking client; every read is one `GET` with a `Range` header.
/// A server that answers with the whole object is downloaded once, and later
/// reads are sliced from that body.
pub struct HttpRangeReader {
    url: Url,
    identifier: String,
    size: u64,
    client: Client,
    full_body: OnceLock<Bytes>,
}

impl HttpRangeReader {
    pub fn new(url: &Url, config: &ReaderConfig) -> CogResult<Self> {
        let identifier = url.to_string();
        let client = Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|source| CogError::Http {
                url: identifier.clone(),
                source,
            })?;

        let mut reader = Self {
            url: url.clone(),
            identifier,
            size: 0,
            client,
            full_body: OnceLock::new(),
        };
        reader.size = reader.discover_size()?;
        debug!(url = %reader.identifier, size = reader.size, "Opened remote raster");
        Ok(reader)
    }

    fn http_error(&self, source: reqwest::Error) -> CogError {
        CogError::Http {
            url: self.identifier.clone(),
            source,
        }
    }

    fn status_error(&self, status: StatusCode) -> CogError {
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            CogError::RemoteNotFound(self.identifier.clone())
        } else {
            CogError::HttpStatus {
                url: self.identifier.clone(),
                status: status.as_u16(),
            }
        }
    }

    /// HEAD for `Content-Length`, falling back to a one byte range request for
    /// servers that refuse HEAD or omit the length.
    fn discover_size(&self) -> CogResult<u64> {
        let response = self
            .client
            .head(self.url.clone())
            .send()
            .map_err(|e| self.http_error(e))?;
        let status = response.status();
        if status.is_success() {
            let length = response
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            if let Some(length) = length {
                return Ok(length);
            }
        } else if status != StatusCode::METHOD_NOT_ALLOWED && status != StatusCode::NOT_IMPLEMENTED {
            return Err(self.status_error(status));
        }

        let response = self
            .client
            .get(self.url.clone())
            .header(RANGE, "bytes=0-0")
            .send()
            .map_err(|e| self.http_error(e))?;
        if !response.status().is_success() {
            return Err(self.status_error(response.status()));
        }
        // Content-Range: bytes 0-0/<total>, or the full length when the range was ignored
        let header = |name: HeaderName| response.headers().get(name).and_then(|v| v.to_str().ok());
        let total = match response.status() {
            StatusCode::PARTIAL_CONTENT => header(CONTENT_RANGE).and_then(|v| v.rsplit('/').next()),
            _ => header(CONTENT_LENGTH),
        };
        Ok(total.and_then(|v| v.parse().ok()).unwrap_or(0))
    }
}

impl RangeReader for HttpRangeReader {
    fn read_range(&self, offset: u64, length: usize) -> CogResult<Bytes> {
        if length == 0 {
            return Ok(Bytes::new());
        }
        let out_of_bounds = || short_read(&self.identifier, offset, length, 0);
        let end = offset.checked_add(length as u64 - 1).ok_or_else(out_of_bounds)?;
        if self.size > 0 && end >= self.size {
            let available = self.size.saturating_sub(offset) as usize;
            return Err(short_read(&self.identifier, offset, length, available));
        }
        if let Some(full) = self.full_body.get() {
            return slice_body(&self.identifier, full, offset, length);
        }

        trace!(url = %self.identifier, offset, length, "Range request");
        let response = self
            .client
            .get(self.url.clone())
            .header(RANGE, format!("bytes={offset}-{end}"))
            .send()
            .map_err(|e| self.http_error(e))?;

        let status = response.status();
        match status {
            StatusCode::PARTIAL_CONTENT => {
                let body = response.bytes().map_err(|e| self.http_error(e))?;
                slice_body(&self.identifier, &body, 0, length)
            }
            StatusCode::OK => {
                let body = response.bytes().map_err(|e| self.http_error(e))?;
                if self.full_body.set(body).is_ok() {
                    warn!(
                        url = %self.identifier,
                        offset,
                        length,
                        "Server ignored the Range header, keeping the full response"
                    );
                }
                let full = self.full_body.get().ok_or_else(out_of_bounds)?;
                slice_body(&self.identifier, full, offset, length)
            }
            StatusCode::RANGE_NOT_SATISFIABLE => Err(out_of_bounds()),
            _ => Err(self.status_error(status)),
        }
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn is_local(&self) -> bool {
        false
    }
}

/// Range reader over bytes already held in memory
pub struct MemoryRangeReader {
    data: Bytes,
    identifier: String,
}

impl MemoryRangeReader {
    pub fn new(data: impl Into<Bytes>, identifier: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            identifier: identifier.into(),
        }
    }
}

impl RangeReader for MemoryRangeReader {
    fn read_range(&self, offset: u64, length: usize) -> CogResult<Bytes> {
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        match start.checked_add(length) {
            Some(end) if end <= self.data.len() => Ok(self.data.slice(start..end)),
            _ => Err(short_read(
                &self.identifier,
                offset,
                length,
                self.data.len().saturating_sub(start),
            )),
        }
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn is_local(&self) -> bool {
        true
    }
}

/// Serves reads that fall inside the leading bytes of the file from one
/// up-front fetch. COG writers place every IFD there, so parsing the whole
/// directory chain costs a single request.
pub struct HeaderPrefetchReader {
    inner: Arc<dyn RangeReader>,
    prefix: Bytes,
}

impl HeaderPrefetchReader {
    pub fn new(inner: Arc<dyn RangeReader>, prefetch_bytes: usize) -> CogResult<Self> {
        let size = inner.size();
        let length = if size == 0 {
            0
        } else {
            prefetch_bytes.min(usize::try_from(size).unwrap_or(usize::MAX))
        };
        let prefix = inner.read_range(0, length)?;
        debug!(source = %inner.identifier(), bytes = prefix.len(), "Prefetched header");
        Ok(Self { inner, prefix })
    }
}

impl RangeReader for HeaderPrefetchReader {
    fn read_range(&self, offset: u64, length: usize) -> CogResult<Bytes> {
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        match start.checked_add(length) {
            Some(end) if end <= self.prefix.len() => Ok(self.prefix.slice(start..end)),
            _ => self.inner.read_range(offset, length),
        }
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn identifier(&self) -> &str {
        self.inner.identifier()
    }

    fn is_local(&self) -> bool {
        self.inner.is_local()
    }
}

/// Create a range reader for a resolved location
pub fn create_range_reader(
    location: &RasterLocation,
    config: &ReaderConfig,
) -> CogResult<Arc<dyn RangeReader>> {
    let reader: Arc<dyn RangeReader> = match location {
        RasterLocation::LocalPath(path) => Arc::new(LocalRangeReader::new(path)?),
        RasterLocation::RemoteUrl(url) => Arc::new(HttpRangeReader::new(url, config)?),
    };
    if config.header_prefetch_bytes == 0 {
        return Ok(reader);
    }
    Ok(Arc::new(HeaderPrefetchReader::new(reader, config.header_prefetch_bytes)?))
}
