//! Band/raster assembly: placing decoded chunks into a CHW window
//!
//! Chunks are cut into per-band [`DecodedTile`]s, and every tile is reduced to
//! row spans that intersect the requested window. Overhanging edge tiles are
//! cropped here, so each pixel of the window is written by exactly one span.

use std::ops::Range;

use crate::directory::ImageDirectory;
use crate::scheduler::Window;

/// One band of one decoded chunk
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedTile<T> {
    /// Index of the chunk in `tile_offsets`
    pub tile_index: usize,
    pub band_index: usize,
    pub tile_row: usize,
    pub tile_col: usize,
    /// Stored width of the chunk in pixels
    pub width: usize,
    /// Stored rows of the chunk
    pub rows: usize,
    /// Row-major samples, `width * rows`
    pub samples: Vec<T>,
}

/// A run of contiguous pixels of one tile row that lands in the window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowSpan {
    pub band: usize,
    /// Row relative to the window
    pub window_row: usize,
    /// Column relative to the window
    pub window_col: usize,
    /// Start of the run in `DecodedTile::samples`
    pub src_start: usize,
    pub len: usize,
}

impl RowSpan {
    pub fn src(&self) -> Range<usize> {
        self.src_start..self.src_start + self.len
    }

    /// Offset of the run in a flat CHW buffer holding the whole window
    pub fn flat_offset(&self, window: &Window) -> usize {
        (self.band * window.height + self.window_row) * window.width + self.window_col
    }
}

/// De-interleave a pixel-interleaved chunk into one sample vector per band.
pub fn split_bands<T: Copy>(samples: Vec<T>, bands: usize) -> Vec<Vec<T>> {
    if bands == 1 {
        return vec![samples];
    }
    let pixels = samples.len() / bands;
    let mut planes: Vec<Vec<T>> = (0..bands).map(|_| Vec::with_capacity(pixels)).collect();
    for pixel in samples.chunks_exact(bands) {
        for (plane, &value) in planes.iter_mut().zip(pixel) {
            plane.push(value);
        }
    }
    planes
}

fn intersect(a: Range<usize>, b: Range<usize>) -> Range<usize> {
    a.start.max(b.start)..a.end.min(b.end)
}

/// Row spans of `tile` that fall inside `window`.
pub fn row_spans<T>(
    directory: &ImageDirectory,
    window: &Window,
    tile: &DecodedTile<T>,
) -> impl Iterator<Item = RowSpan> {
    let x0 = tile.tile_col * directory.chunk_width();
    let y0 = tile.tile_row * directory.chunk_height();
    let cols = intersect(x0..x0 + tile.width, window.cols());
    let rows = intersect(y0..y0 + tile.rows, window.rows());
    let (band, width) = (tile.band_index, tile.width);
    let (wx, wy) = (window.x, window.y);

    let len = cols.end.saturating_sub(cols.start);
    rows.filter(move |_| len > 0).map(move |y| RowSpan {
        band,
        window_row: y - wy,
        window_col: cols.start - wx,
        src_start: (y - y0) * width + (cols.start - x0),
        len,
    })
}

/// Copy `tile` into `band_rows`, the slice of its band that holds window rows
/// starting at `first_window_row`.
pub fn place_tile<T: Copy>(
    directory: &ImageDirectory,
    window: &Window,
    tile: &DecodedTile<T>,
    band_rows: &mut [T],
    first_window_row: usize,
) {
    for span in row_spans(directory, window, tile) {
        let at = (span.window_row - first_window_row) * window.width + span.window_col;
        band_rows[at..at + span.len].copy_from_slice(&tile.samples[span.src()]);
    }
}
