//! `GeoTIFF` georeferencing: affine transform, geo keys and coordinate axes

use ndarray::Array1;

use crate::error::{CogError, CogResult, UnsupportedFormat};

const GEO_KEY_RASTER_TYPE: u64 = 1025;
const GEO_KEY_GEOGRAPHIC_TYPE: u64 = 2048;
const GEO_KEY_PROJECTED_CRS: u64 = 3072;

const RASTER_PIXEL_IS_POINT: u64 = 2;

/// How tiepoints relate to pixels (`GTRasterTypeGeoKey`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RasterType {
    /// Tiepoints reference the upper-left corner of a pixel
    #[default]
    PixelIsArea,
    /// Tiepoints reference the pixel center
    PixelIsPoint,
}

/// The subset of the GeoKey directory this crate understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GeoKeys {
    pub raster_type: RasterType,
    /// EPSG code from `ProjectedCSTypeGeoKey`, else `GeographicTypeGeoKey`
    pub epsg: Option<u32>,
}

impl GeoKeys {
    /// Parse the `GeoKeyDirectoryTag` SHORT array.
    ///
    /// Layout: a 4 value header whose last entry is the key count, then
    /// `(key, location, count, value)` quadruples. Only keys stored inline
    /// (location 0) are read.
    pub fn parse(directory: &[u64]) -> Self {
        let mut keys = Self::default();
        let Some(&count) = directory.get(3) else {
            return keys;
        };

        let mut geographic = None;
        let mut projected = None;
        for entry in directory[4..].chunks_exact(4).take(count as usize) {
            let (key, location, value) = (entry[0], entry[1], entry[3]);
            if location != 0 {
                continue;
            }
            match key {
                GEO_KEY_RASTER_TYPE if value == RASTER_PIXEL_IS_POINT => {
                    keys.raster_type = RasterType::PixelIsPoint;
                }
                GEO_KEY_GEOGRAPHIC_TYPE if value > 0 => geographic = Some(value as u32),
                GEO_KEY_PROJECTED_CRS if value > 0 => projected = Some(value as u32),
                _ => {}
            }
        }
        // 32767 means user-defined, not an EPSG code
        keys.epsg = projected.or(geographic).filter(|&code| code != 32767);
        keys
    }
}

/// North-up affine transform from pixel corners to world coordinates.
///
/// `x = origin_x + col * pixel_width`, `y = origin_y + row * pixel_height`,
/// where `(col, row)` addresses pixel corners. `pixel_height` is negative for
/// the usual north-up raster.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub origin_y: f64,
    pub pixel_width: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// Build the transform from the model tags present in an IFD.
    ///
    /// `ModelTransformationTag` wins over `ModelPixelScale` + `ModelTiepoint`.
    /// Returns `Ok(None)` when the file carries no georeferencing.
    pub fn from_tags(
        pixel_scale: Option<&[f64]>,
        tiepoint: Option<&[f64]>,
        transformation: Option<&[f64]>,
        raster_type: RasterType,
    ) -> CogResult<Option<Self>> {
        let transform = match (transformation, pixel_scale, tiepoint) {
            (Some(m), _, _) if m.len() >= 8 => {
                if m[1] != 0.0 || m[4] != 0.0 {
                    return Err(UnsupportedFormat::RotatedTransform.into());
                }
                Self {
                    origin_x: m[3],
                    origin_y: m[7],
                    pixel_width: m[0],
                    pixel_height: m[5],
                }
            }
            (_, Some(scale), Some(tie)) if scale.len() >= 2 && tie.len() >= 6 => Self {
                origin_x: tie[3] - tie[0] * scale[0],
                origin_y: tie[4] + tie[1] * scale[1],
                pixel_width: scale[0],
                pixel_height: -scale[1],
            },
            _ => return Ok(None),
        };

        Ok(Some(match raster_type {
            RasterType::PixelIsArea => transform,
            RasterType::PixelIsPoint => Self {
                origin_x: transform.origin_x - 0.5 * transform.pixel_width,
                origin_y: transform.origin_y - 0.5 * transform.pixel_height,
                ..transform
            },
        }))
    }

    /// Transform for a reduced-resolution copy of the same extent.
    #[must_use]
    pub fn scaled(&self, x_factor: f64, y_factor: f64) -> Self {
        Self {
            pixel_width: self.pixel_width * x_factor,
            pixel_height: self.pixel_height * y_factor,
            ..*self
        }
    }

    fn is_degenerate(&self) -> bool {
        [self.origin_x, self.origin_y, self.pixel_width, self.pixel_height]
            .iter()
            .any(|v| !v.is_finite())
            || self.pixel_width == 0.0
            || self.pixel_height == 0.0
    }

    /// Pixel-center coordinate axes for a `width` x `height` grid.
    pub fn coordinates(&self, width: usize, height: usize) -> CogResult<CoordinateAxes> {
        if self.is_degenerate() {
            return Err(CogError::from(UnsupportedFormat::GeoTransform(format!(
                "degenerate transform {self:?}"
            ))));
        }
        let x = Array1::from_shape_fn(width, |i| {
            self.origin_x + (i as f64 + 0.5) * self.pixel_width
        });
        let y = Array1::from_shape_fn(height, |j| {
            self.origin_y + (j as f64 + 0.5) * self.pixel_height
        });
        Ok(CoordinateAxes { x, y })
    }
}

/// Pixel-center coordinates along each raster axis
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinateAxes {
    /// One value per column
    pub x: Array1<f64>,
    /// One value per row
    pub y: Array1<f64>,
}
