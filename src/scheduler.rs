//! Parallel decode scheduler
//!
//! A read is planned as the grid of tile rows and tile columns covering a
//! window. Each tile row is one task on a bounded rayon pool and the chunks of
//! a row are fetched and decoded with nested parallelism. The destination buffer
//! is split up front into disjoint per-row, per-band slices, so every tile is
//! written at a fixed position and the result does not depend on the order in
//! which tasks finish.

use std::ops::Range;
use std::sync::mpsc;

use bytes::Bytes;
use ndarray::Array3;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::debug;

use crate::assembler::{DecodedTile, place_tile, split_bands};
use crate::config::ReaderConfig;
use crate::directory::{ImageDirectory, PlanarConfiguration};
use crate::error::{CogError, CogResult};
use crate::range_reader::RangeReader;
use crate::raster::Sample;

/// A pixel rectangle of a directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl Window {
    pub fn full(directory: &ImageDirectory) -> Self {
        Self {
            x: 0,
            y: 0,
            width: directory.width,
            height: directory.height,
        }
    }

    pub fn cols(&self) -> Range<usize> {
        self.x..self.x + self.width
    }

    pub fn rows(&self) -> Range<usize> {
        self.y..self.y + self.height
    }

    fn validate(&self, directory: &ImageDirectory) -> CogResult<()> {
        let fits = |start: usize, len: usize, limit: usize| {
            len > 0 && start.checked_add(len).is_some_and(|end| end <= limit)
        };
        if fits(self.x, self.width, directory.width) && fits(self.y, self.height, directory.height) {
            Ok(())
        } else {
            Err(CogError::InvalidWindow {
                x: self.x,
                y: self.y,
                width: self.width,
                height: self.height,
                raster_width: directory.width,
                raster_height: directory.height,
            })
        }
    }
}

/// The tile rows and columns a window needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilePlan {
    pub window: Window,
    pub tile_rows: Range<usize>,
    pub tile_cols: Range<usize>,
    chunk_height: usize,
}

impl TilePlan {
    pub fn for_window(directory: &ImageDirectory, window: Window) -> CogResult<Self> {
        window.validate(directory)?;
        let (chunk_width, chunk_height) = (directory.chunk_width(), directory.chunk_height());
        Ok(Self {
            window,
            tile_rows: window.y / chunk_height..(window.y + window.height).div_ceil(chunk_height),
            tile_cols: window.x / chunk_width..(window.x + window.width).div_ceil(chunk_width),
            chunk_height,
        })
    }

    /// Window-relative rows covered by `tile_row`
    pub fn window_rows(&self, tile_row: usize) -> Range<usize> {
        let start = (tile_row * self.chunk_height).max(self.window.y);
        let end = ((tile_row + 1) * self.chunk_height).min(self.window.y + self.window.height);
        start - self.window.y..end - self.window.y
    }

    /// Number of chunks fetched to serve the window
    pub fn chunk_count(&self, directory: &ImageDirectory) -> usize {
        self.tile_rows.len() * self.tile_cols.len() * directory.planes()
    }
}

/// The band slices of one tile row in the destination buffer
struct TileRowJob<'a, T> {
    tile_row: usize,
    bands: Vec<&'a mut [T]>,
}

/// Bounded worker pool that fetches and decodes chunks
pub struct DecodeScheduler {
    pool: ThreadPool,
    threads: usize,
}

impl DecodeScheduler {
    pub fn new(config: &ReaderConfig) -> CogResult<Self> {
        let threads = config.effective_concurrency();
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("cog-decode-{i}"))
            .build()?;
        Ok(Self { pool, threads })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Decode `window` of `directory` into a CHW array.
    ///
    /// The first failing chunk stops the scheduling of further work and its
    /// error is returned; no partially filled buffer escapes.
    pub fn decode_window<T: Sample>(
        &self,
        source: &dyn RangeReader,
        directory: &ImageDirectory,
        window: Window,
    ) -> CogResult<Array3<T>> {
        let plan = TilePlan::for_window(directory, window)?;
        debug!(
            source = %source.identifier(),
            window = ?plan.window,
            chunks = plan.chunk_count(directory),
            threads = self.threads,
            "Decoding window"
        );

        let band_len = window.width * window.height;
        let mut data = vec![T::default(); directory.bands * band_len];

        let mut jobs: Vec<TileRowJob<'_, T>> = plan
            .tile_rows
            .clone()
            .map(|tile_row| TileRowJob {
                tile_row,
                bands: Vec::with_capacity(directory.bands),
            })
            .collect();
        for band in data.chunks_mut(band_len) {
            let mut rest = band;
            for job in &mut jobs {
                let rows = plan.window_rows(job.tile_row).len();
                let (head, tail) = std::mem::take(&mut rest).split_at_mut(rows * window.width);
                job.bands.push(head);
                rest = tail;
            }
        }

        self.pool.install(|| {
            jobs.into_par_iter().try_for_each(|mut job| {
                let first_row = plan.window_rows(job.tile_row).start;
                for tile in self.decode_tile_row::<T>(source, directory, &plan, job.tile_row)? {
                    let band_rows = &mut job.bands[tile.band_index];
                    place_tile(directory, &plan.window, &tile, band_rows, first_row);
                }
                Ok::<_, CogError>(())
            })
        })?;

        Array3::from_shape_vec((directory.bands, window.height, window.width), data)
            .map_err(|e| CogError::Export(e.to_string()))
    }

    /// Fetch and decode every chunk of one tile row, split into bands.
    fn decode_tile_row<T: Sample>(
        &self,
        source: &dyn RangeReader,
        directory: &ImageDirectory,
        plan: &TilePlan,
        tile_row: usize,
    ) -> CogResult<Vec<DecodedTile<T>>> {
        let chunks: Vec<(usize, usize)> = plan
            .tile_cols
            .clone()
            .flat_map(|col| (0..directory.planes()).map(move |plane| (col, plane)))
            .collect();
        let decoded = chunks
            .into_par_iter()
            .map(|(tile_col, plane)| decode_chunk(source, directory, tile_row, tile_col, plane))
            .collect::<CogResult<Vec<_>>>()?;
        Ok(decoded.into_iter().flatten().collect())
    }

    /// Run the decode fan-out and hand each finished tile row to `consume` on
    /// the calling thread.
    ///
    /// Rows arrive in completion order over a bounded channel, so at most a
    /// few decoded rows are buffered at once. If `consume` fails, the remaining
    /// work is abandoned and that error is returned.
    pub fn stream_tile_rows<T, F>(
        &self,
        source: &dyn RangeReader,
        directory: &ImageDirectory,
        window: Window,
        mut consume: F,
    ) -> CogResult<()>
    where
        T: Sample,
        F: FnMut(usize, Vec<DecodedTile<T>>) -> CogResult<()>,
    {
        let plan = TilePlan::for_window(directory, window)?;
        debug!(
            source = %source.identifier(),
            window = ?plan.window,
            chunks = plan.chunk_count(directory),
            "Streaming window"
        );

        std::thread::scope(|scope| {
            let (tx, rx) = mpsc::sync_channel::<(usize, Vec<DecodedTile<T>>)>(self.threads);
            let plan = &plan;
            let producer = scope.spawn(move || {
                self.pool.install(|| {
                    plan.tile_rows
                        .clone()
                        .into_par_iter()
                        .try_for_each_with(tx, |tx, tile_row| {
                            let tiles = self.decode_tile_row::<T>(source, directory, plan, tile_row)?;
                            tx.send((tile_row, tiles)).map_err(|_| {
                                CogError::Io(std::io::Error::new(
                                    std::io::ErrorKind::BrokenPipe,
                                    "tile row consumer stopped",
                                ))
                            })
                        })
                })
            });

            let consumed = rx
                .iter()
                .try_for_each(|(tile_row, tiles)| consume(tile_row, tiles));
            drop(rx);

            let produced = match producer.join() {
                Ok(result) => result,
                Err(panic) => std::panic::resume_unwind(panic),
            };
            consumed.and(produced)
        })
    }
}

fn decode_chunk<T: Sample>(
    source: &dyn RangeReader,
    directory: &ImageDirectory,
    tile_row: usize,
    tile_col: usize,
    plane: usize,
) -> CogResult<Vec<DecodedTile<T>>> {
    let index = directory.chunk_index(tile_row, tile_col, plane);
    let (offset, byte_count) = (directory.tile_offsets[index], directory.tile_byte_counts[index]);
    let compressed = if byte_count == 0 {
        Bytes::new()
    } else {
        let length = usize::try_from(byte_count)
            .map_err(|_| CogError::InvalidTiff(format!("chunk {index} is too large")))?;
        source.read_range(offset, length)?
    };

    let (width, rows) = (directory.chunk_width(), directory.stored_rows(tile_row));
    let samples = directory
        .chunk_decoder()
        .decode::<T>(&compressed, width, rows)
        .map_err(|source| CogError::CorruptData {
            chunk: index,
            source,
        })?;

    let tile = |band_index, samples| DecodedTile {
        tile_index: index,
        band_index,
        tile_row,
        tile_col,
        width,
        rows,
        samples,
    };
    Ok(match directory.planar {
        PlanarConfiguration::Planar => vec![tile(plane, samples)],
        PlanarConfiguration::Chunky => split_bands(samples, directory.bands)
            .into_iter()
            .enumerate()
            .map(|(band, samples)| tile(band, samples))
            .collect(),
    })
}
