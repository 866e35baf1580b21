use crate::error::{Error, Result};

/// A single-channel image of floating-point samples.
///
/// Samples are stored row by row in a 1D `Vec<f32>`, so the sample at `(x, y)`
/// lives at index `x + y * width`. Non-finite samples (`NaN`) mark pixels that
/// carry no data, for example canvas pixels that an exposure does not cover.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    /// Pixel samples in row-major order.
    pub data: Vec<f32>,
    /// The width (in pixels) of the raster.
    pub width: usize,
    /// The height (in pixels) of the raster.
    pub height: usize,
}

impl Default for Raster {
    /// Creates an empty `Raster` with zero width and height, and no samples.
    fn default() -> Raster {
        Raster {
            data: Vec::new(),
            width: 0,
            height: 0,
        }
    }
}

impl Raster {
    /// Creates a `width` × `height` raster filled with zeros.
    pub fn new(width: usize, height: usize) -> Self {
        Self::filled(width, height, 0.0)
    }

    /// Creates a `width` × `height` raster with every sample set to `value`.
    pub fn filled(width: usize, height: usize, value: f32) -> Self {
        Raster {
            data: vec![value; width * height],
            width,
            height,
        }
    }

    /// Wraps existing row-major samples.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if `data.len() != width * height`.
    ///
    /// # Examples
    /// ```
    /// # use starstack::raster::Raster;
    /// let r = Raster::from_vec(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
    /// assert_eq!(r.get(1, 1), 4.0);
    /// assert!(Raster::from_vec(3, 2, vec![0.0; 4]).is_err());
    /// ```
    pub fn from_vec(width: usize, height: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != width * height {
            return Err(Error::InvalidArgument(format!(
                "raster of {}x{} needs {} samples, got {}",
                width,
                height,
                width * height,
                data.len()
            )));
        }
        Ok(Raster { data, width, height })
    }

    /// Returns the sample at `(x, y)`.
    ///
    /// # Panics
    /// Panics if `(x, y)` is outside the raster.
    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.data[x + y * self.width]
    }

    /// Returns the sample at a signed coordinate, or `None` when it falls outside.
    pub fn get_checked(&self, x: isize, y: isize) -> Option<f32> {
        if x < 0 || y < 0 || x as usize >= self.width || y as usize >= self.height {
            None
        } else {
            Some(self.data[x as usize + y as usize * self.width])
        }
    }

    /// Overwrites the sample at `(x, y)`.
    pub fn set(&mut self, x: usize, y: usize, value: f32) {
        self.data[x + y * self.width] = value;
    }

    pub fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// Multiplies every sample by `factor` in place.
    pub fn scale(&mut self, factor: f32) {
        for v in self.data.iter_mut() {
            *v *= factor;
        }
    }

    /// Number of finite samples.
    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|v| v.is_finite()).count()
    }

    /// Crops the raster to the bounding box of its finite samples.
    ///
    /// ```text
    /// +----------+
    /// |   NaN    |
    /// |  +----+  |      +----+
    /// |  |####|  |  =>  |####|
    /// |  +----+  |      +----+
    /// +----------+
    /// ```
    ///
    /// Returns an empty raster when no sample is finite.
    pub fn crop_nan(&self) -> Raster {
        let mut min_x = usize::MAX;
        let mut max_x = 0;
        let mut min_y = usize::MAX;
        let mut max_y = 0;
        for y in 0..self.height {
            for x in 0..self.width {
                if self.get(x, y).is_finite() {
                    min_x = min_x.min(x);
                    max_x = max_x.max(x);
                    min_y = min_y.min(y);
                    max_y = max_y.max(y);
                }
            }
        }
        if min_x == usize::MAX {
            return Raster::default();
        }

        let width = max_x - min_x + 1;
        let height = max_y - min_y + 1;
        let mut data = Vec::with_capacity(width * height);
        for y in min_y..=max_y {
            let row = y * self.width;
            data.extend_from_slice(&self.data[row + min_x..=row + max_x]);
        }
        Raster { data, width, height }
    }

    /// Finite minimum and maximum, or `None` if no sample is finite.
    pub fn finite_range(&self) -> Option<(f32, f32)> {
        self.data
            .iter()
            .filter(|v| v.is_finite())
            .fold(None, |acc, &v| match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            })
    }
}
