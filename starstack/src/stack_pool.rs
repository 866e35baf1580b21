use crate::error::{Error, Result};
use crate::raster::Raster;
use rayon::prelude::*;
use std::fmt;
use std::str::FromStr;

/// How the samples of one output pixel are reduced across exposures.
///
/// Non-finite samples never take part; a pixel without any finite sample
/// reduces to `NaN`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum CombineMethod {
    #[default]
    Sum,
    Mean,
    Median,
    Min,
    Max,
}

impl CombineMethod {
    /// Reduces `samples`, reordering them in place.
    fn reduce(self, samples: &mut [f32]) -> f32 {
        if samples.is_empty() {
            return f32::NAN;
        }
        match self {
            CombineMethod::Sum => samples.iter().map(|&v| v as f64).sum::<f64>() as f32,
            CombineMethod::Mean => {
                (samples.iter().map(|&v| v as f64).sum::<f64>() / samples.len() as f64) as f32
            }
            CombineMethod::Median => {
                samples.sort_by(f32::total_cmp);
                let middle = samples.len() / 2;
                if samples.len() % 2 == 0 {
                    (samples[middle - 1] + samples[middle]) / 2.0
                } else {
                    samples[middle]
                }
            }
            CombineMethod::Min => samples.iter().copied().fold(f32::INFINITY, f32::min),
            CombineMethod::Max => samples.iter().copied().fold(f32::NEG_INFINITY, f32::max),
        }
    }
}

impl FromStr for CombineMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sum" => Ok(CombineMethod::Sum),
            "mean" => Ok(CombineMethod::Mean),
            "median" => Ok(CombineMethod::Median),
            "min" => Ok(CombineMethod::Min),
            "max" => Ok(CombineMethod::Max),
            other => Err(Error::InvalidArgument(format!(
                "unknown combine method '{other}' (expected sum, mean, median, min or max)"
            ))),
        }
    }
}

impl fmt::Display for CombineMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CombineMethod::Sum => "sum",
            CombineMethod::Mean => "mean",
            CombineMethod::Median => "median",
            CombineMethod::Min => "min",
            CombineMethod::Max => "max",
        };
        f.write_str(name)
    }
}

/// A stack of equally sized rasters, one slice per exposure.
///
/// Slices start out `NaN` (no data) and are filled with [`StackPool::paste`].
#[derive(Debug, Clone)]
pub struct StackPool {
    width: usize,
    height: usize,
    depth: usize,
    data: Vec<f32>,
}

impl StackPool {
    pub fn new(width: usize, height: usize, depth: usize) -> Self {
        StackPool {
            width,
            height,
            depth,
            data: vec![f32::NAN; width * height * depth],
        }
    }

    /// `(width, height, depth)`.
    pub fn dimensions(&self) -> (usize, usize, usize) {
        (self.width, self.height, self.depth)
    }

    /// Copies `raster` into slice `z`.
    ///
    /// # Errors
    /// [`Error::InvalidArgument`] if `z` is out of range and
    /// [`Error::DimensionMismatch`] if the raster does not have the pool's size.
    pub fn paste(&mut self, z: usize, raster: &Raster) -> Result<()> {
        if z >= self.depth {
            return Err(Error::InvalidArgument(format!(
                "slice {z} outside a pool of depth {}",
                self.depth
            )));
        }
        if raster.dimensions() != (self.width, self.height) {
            return Err(Error::DimensionMismatch {
                expected: (self.width, self.height),
                actual: raster.dimensions(),
            });
        }
        let len = self.width * self.height;
        self.data[z * len..(z + 1) * len].copy_from_slice(&raster.data);
        Ok(())
    }

    /// Slice `z` as a raster.
    pub fn slice(&self, z: usize) -> Option<Raster> {
        let len = self.width * self.height;
        (z < self.depth).then(|| Raster {
            data: self.data[z * len..(z + 1) * len].to_vec(),
            width: self.width,
            height: self.height,
        })
    }

    /// Reduces the pool along the exposure axis.
    ///
    /// # Examples
    /// ```
    /// # use starstack::raster::Raster;
    /// # use starstack::stack_pool::{CombineMethod, StackPool};
    /// let mut pool = StackPool::new(2, 1, 3);
    /// pool.paste(0, &Raster::from_vec(2, 1, vec![1.0, f32::NAN]).unwrap()).unwrap();
    /// pool.paste(1, &Raster::from_vec(2, 1, vec![2.0, f32::NAN]).unwrap()).unwrap();
    /// let sum = pool.reduce(CombineMethod::Sum);
    /// assert_eq!(sum.get(0, 0), 3.0);
    /// assert!(sum.get(1, 0).is_nan());
    /// ```
    pub fn reduce(&self, method: CombineMethod) -> Raster {
        let len = self.width * self.height;
        let data: Vec<f32> = (0..len)
            .into_par_iter()
            .map_init(
                || Vec::with_capacity(self.depth),
                |samples, i| {
                    samples.clear();
                    samples.extend(
                        (0..self.depth)
                            .map(|z| self.data[z * len + i])
                            .filter(|v| v.is_finite()),
                    );
                    method.reduce(samples)
                },
            )
            .collect();
        Raster {
            data,
            width: self.width,
            height: self.height,
        }
    }
}
