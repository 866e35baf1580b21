//! Co-adding registered exposures on a common canvas.
//!
//! A [`Stacker`] holds one forward [`Warper`] per exposure together with an
//! opaque handle. Pixels are only read when stacking, through an
//! [`ExposureSource`] that resolves handles, and the result is handed to a
//! [`StackSink`]. Both are supplied by the caller so that file formats stay
//! out of the library.

use crate::error::{Error, Result};
use crate::raster::Raster;
use crate::resample::{warp_raster, Canvas};
use crate::stack_pool::{CombineMethod, StackPool};
use crate::warper::Warper;
use tracing::{debug, info, info_span};

/// Integer coordinates within this distance are snapped when sizing the canvas.
const CORNER_TOLERANCE: f64 = 1e-6;

/// Pixel data of one exposure as delivered by an [`ExposureSource`].
#[derive(Debug, Clone, PartialEq)]
pub struct Exposure {
    pub pixels: Raster,
    /// Every sample is multiplied by this factor before resampling.
    pub exposure_time: f64,
}

/// Resolves exposure handles to pixel data.
pub trait ExposureSource<H> {
    /// Width and height of the exposure, read without loading its pixels.
    fn dimensions(&self, handle: &H) -> Result<(usize, usize)>;

    fn load(&self, handle: &H) -> Result<Exposure>;
}

/// Receives the combined raster.
pub trait StackSink<D> {
    fn write(&self, destination: &D, raster: &Raster) -> Result<()>;
}

/// Tuning values of the stacking pass.
#[derive(Debug, Clone, PartialEq)]
pub struct StackParameters {
    /// Order of the Lanczos resampling kernel.
    pub kernel_order: usize,
    /// Grid intervals per axis used to approximate each inverse warp.
    pub inverse_grid_steps: usize,
    pub combine: CombineMethod,
}

impl Default for StackParameters {
    fn default() -> Self {
        StackParameters {
            kernel_order: 2,
            inverse_grid_steps: 100,
            combine: CombineMethod::Sum,
        }
    }
}

/// The combined image and where it sits in the common frame.
#[derive(Debug, Clone)]
pub struct StackResult {
    pub raster: Raster,
    pub canvas: Canvas,
}

/// Collects exposures and their forward warps, then resamples and combines
/// them onto one canvas.
#[derive(Debug, Clone)]
pub struct Stacker<H> {
    parameters: StackParameters,
    exposures: Vec<(Warper, H)>,
}

impl<H> Default for Stacker<H> {
    fn default() -> Self {
        Stacker::new(StackParameters::default())
    }
}

impl<H> Stacker<H> {
    pub fn new(parameters: StackParameters) -> Self {
        Stacker {
            parameters,
            exposures: Vec::new(),
        }
    }

    pub fn parameters(&self) -> &StackParameters {
        &self.parameters
    }

    /// Registers an exposure: `warper` maps its pixel frame to the common frame.
    pub fn add(&mut self, warper: Warper, handle: H) {
        self.exposures.push((warper, handle));
    }

    pub fn len(&self) -> usize {
        self.exposures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exposures.is_empty()
    }

    /// The registered warpers and handles, in insertion order.
    pub fn exposures(&self) -> &[(Warper, H)] {
        &self.exposures
    }

    /// Resamples every exposure onto a common canvas and combines them.
    ///
    /// Each forward warp is inverted over its exposure's pixel extent with
    /// [`Warper::approximate_inverse`]. The canvas is the bounding box of the
    /// forward-mapped exposure corners. Exposures are then loaded one at a
    /// time, scaled by their exposure time, resampled and reduced with the
    /// configured [`CombineMethod`].
    ///
    /// # Errors
    /// Any failure aborts the whole run: an inverse that cannot be fitted, an
    /// exposure that cannot be loaded or whose size differs from the one
    /// reported by [`ExposureSource::dimensions`], and an empty stacker or
    /// empty canvas ([`Error::InvalidArgument`]).
    pub fn combine<S: ExposureSource<H>>(&self, source: &S) -> Result<StackResult> {
        let _span = info_span!("stack", exposures = self.exposures.len()).entered();
        if self.exposures.is_empty() {
            return Err(Error::InvalidArgument("no exposures to stack".into()));
        }

        let mut inverses = Vec::with_capacity(self.exposures.len());
        let mut low = [f64::INFINITY; 2];
        let mut high = [f64::NEG_INFINITY; 2];
        for (warper, handle) in &self.exposures {
            let (width, height) = source.dimensions(handle)?;
            let (w, h) = (width as f64, height as f64);
            for corner in [[0.0, 0.0], [w, 0.0], [0.0, h], [w, h]] {
                let c = warper.apply(corner);
                for axis in 0..2 {
                    low[axis] = low[axis].min(c[axis]);
                    high[axis] = high[axis].max(c[axis]);
                }
            }
            inverses.push((
                warper.approximate_inverse(0.0, w, 0.0, h, self.parameters.inverse_grid_steps)?,
                (width, height),
            ));
        }
        let canvas = canvas_for(low, high)?;
        info!(
            x = canvas.origin[0],
            y = canvas.origin[1],
            width = canvas.width,
            height = canvas.height,
            "canvas"
        );

        let mut pool = StackPool::new(canvas.width, canvas.height, self.exposures.len());
        for (z, ((_, handle), (inverse, expected))) in self.exposures.iter().zip(&inverses).enumerate() {
            let exposure = source.load(handle)?;
            let mut pixels = exposure.pixels;
            if pixels.dimensions() != *expected {
                return Err(Error::DimensionMismatch {
                    expected: *expected,
                    actual: pixels.dimensions(),
                });
            }
            pixels.scale(exposure.exposure_time as f32);
            let warped = warp_raster(&pixels, inverse, &canvas, self.parameters.kernel_order);
            debug!(exposure = z, covered = warped.valid_count(), "resampled");
            pool.paste(z, &warped)?;
        }

        let raster = pool.reduce(self.parameters.combine);
        info!(method = %self.parameters.combine, "combined");
        Ok(StackResult { raster, canvas })
    }

    /// Combines the exposures and writes the result to `destination`.
    ///
    /// Nothing is written when combining fails.
    pub fn stack<S, K, D>(&self, source: &S, sink: &K, destination: &D) -> Result<Canvas>
    where
        S: ExposureSource<H>,
        K: StackSink<D>,
    {
        let result = self.combine(source)?;
        sink.write(destination, &result.raster)?;
        Ok(result.canvas)
    }
}

/// Integer-aligned canvas covering `[low, high]`.
fn canvas_for(low: [f64; 2], high: [f64; 2]) -> Result<Canvas> {
    let mut origin = [0.0; 2];
    let mut size = [0usize; 2];
    for axis in 0..2 {
        let first = (low[axis] + CORNER_TOLERANCE).floor();
        let last = (high[axis] - CORNER_TOLERANCE).ceil();
        if !(first.is_finite() && last.is_finite()) || last <= first {
            return Err(Error::InvalidArgument(format!(
                "exposures cover an empty canvas ({low:?} to {high:?})"
            )));
        }
        origin[axis] = first;
        size[axis] = (last - first) as usize;
    }
    Ok(Canvas {
        origin,
        width: size[0],
        height: size[1],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::cell::RefCell;
    use std::collections::HashMap;

    struct MemorySource(HashMap<u32, Exposure>);

    impl ExposureSource<u32> for MemorySource {
        fn dimensions(&self, handle: &u32) -> Result<(usize, usize)> {
            self.load(handle).map(|e| e.pixels.dimensions())
        }

        fn load(&self, handle: &u32) -> Result<Exposure> {
            self.0.get(handle).cloned().ok_or_else(|| Error::Load {
                handle: handle.to_string(),
                reason: "unknown exposure".into(),
            })
        }
    }

    #[derive(Default)]
    struct MemorySink(RefCell<Vec<(String, Raster)>>);

    impl StackSink<String> for MemorySink {
        fn write(&self, destination: &String, raster: &Raster) -> Result<()> {
            self.0.borrow_mut().push((destination.clone(), raster.clone()));
            Ok(())
        }
    }

    fn exposure(raster: Raster, exposure_time: f64) -> Exposure {
        Exposure {
            pixels: raster,
            exposure_time,
        }
    }

    #[test]
    fn empty_stacker_fails() {
        let stacker: Stacker<u32> = Stacker::default();
        assert!(matches!(
            stacker.combine(&MemorySource(HashMap::new())),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn canvas_is_bounding_box_of_corners() {
        let c = canvas_for([-3.5, 2.0], [10.2, 7.0 + 1e-9]).unwrap();
        assert_eq!(c.origin, [-4.0, 2.0]);
        assert_eq!((c.width, c.height), (15, 5));
        assert!(canvas_for([1.0, 1.0], [1.0, 5.0]).is_err());
        assert!(canvas_for([f64::NAN, 1.0], [1.0, 5.0]).is_err());
    }

    #[test]
    fn single_exposure_is_scaled_by_exposure_time() {
        let source = MemorySource(HashMap::from([(1, exposure(Raster::filled(10, 8, 2.0), 1.5))]));
        let mut stacker: Stacker<u32> = Stacker::default();
        stacker.add(Warper::identity(2).unwrap(), 1);
        let result = stacker.combine(&source).unwrap();
        assert_eq!(result.canvas.origin, [0.0, 0.0]);
        assert_eq!(result.raster.dimensions(), (10, 8));
        for v in &result.raster.data {
            assert_abs_diff_eq!(*v, 3.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn offset_exposures_are_summed_where_they_overlap() {
        let source = MemorySource(HashMap::from([
            (1, exposure(Raster::filled(20, 20, 1.0), 1.0)),
            (2, exposure(Raster::filled(20, 20, 1.0), 1.0)),
        ]));
        let mut stacker: Stacker<u32> = Stacker::default();
        stacker.add(Warper::identity(2).unwrap(), 1);
        stacker.add(Warper::identity(2).unwrap().translated(10.0, 0.0), 2);
        let result = stacker.combine(&source).unwrap();
        assert_eq!(result.raster.dimensions(), (30, 20));
        assert_abs_diff_eq!(result.raster.get(3, 10), 1.0, epsilon = 1e-4);
        assert_abs_diff_eq!(result.raster.get(15, 10), 2.0, epsilon = 1e-4);
        assert_abs_diff_eq!(result.raster.get(26, 10), 1.0, epsilon = 1e-4);
    }

    #[test]
    fn stack_writes_to_sink() {
        let source = MemorySource(HashMap::from([(7, exposure(Raster::filled(6, 6, 4.0), 1.0))]));
        let mut stacker: Stacker<u32> = Stacker::new(StackParameters {
            combine: CombineMethod::Mean,
            ..StackParameters::default()
        });
        stacker.add(Warper::identity(2).unwrap(), 7);
        let sink = MemorySink::default();
        let canvas = stacker.stack(&source, &sink, &"out".to_string()).unwrap();
        let written = sink.0.borrow();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].0, "out");
        assert_eq!(written[0].1.dimensions(), (canvas.width, canvas.height));
    }

    #[test]
    fn load_failure_aborts_without_writing() {
        struct Broken;
        impl ExposureSource<u32> for Broken {
            fn dimensions(&self, _: &u32) -> Result<(usize, usize)> {
                Ok((4, 4))
            }
            fn load(&self, handle: &u32) -> Result<Exposure> {
                Err(Error::Load {
                    handle: handle.to_string(),
                    reason: "truncated file".into(),
                })
            }
        }
        let mut stacker: Stacker<u32> = Stacker::default();
        stacker.add(Warper::identity(2).unwrap(), 3);
        let sink = MemorySink::default();
        assert!(matches!(
            stacker.stack(&Broken, &sink, &"out".to_string()),
            Err(Error::Load { .. })
        ));
        assert!(sink.0.borrow().is_empty());
    }

    #[test]
    fn size_change_between_dimensions_and_load_is_rejected() {
        struct Shrinking;
        impl ExposureSource<u32> for Shrinking {
            fn dimensions(&self, _: &u32) -> Result<(usize, usize)> {
                Ok((8, 8))
            }
            fn load(&self, _: &u32) -> Result<Exposure> {
                Ok(Exposure {
                    pixels: Raster::new(4, 4),
                    exposure_time: 1.0,
                })
            }
        }
        let mut stacker: Stacker<u32> = Stacker::default();
        stacker.add(Warper::identity(2).unwrap(), 0);
        assert!(matches!(
            stacker.combine(&Shrinking),
            Err(Error::DimensionMismatch { .. })
        ));
    }
}
