use crate::catalog::merge_sources;
use crate::error::Result;
use crate::source::SourcePoint;
use crate::stacker::{StackParameters, Stacker};
use crate::warper::{FitParameters, Warper};
use tracing::{info, info_span};

/// Match radius used when folding an exposure's catalog into the running one.
pub const MERGE_RADIUS: f64 = 2.5;

/// Registers a sequence of exposures against a growing reference catalog.
///
/// Every exposure's catalog is fitted against the running catalog, starting
/// from the warper of the previous exposure, then merged into it so that
/// later exposures can also match stars that only earlier non-reference
/// exposures contained. The fitted warpers are queued on a [`Stacker`].
///
/// # Examples
/// ```
/// # use starstack::mosaic::Mosaic;
/// # use starstack::source::SourcePoint;
/// # use starstack::stacker::StackParameters;
/// let stars: Vec<SourcePoint> = (0..16)
///     .map(|i| SourcePoint::new((i % 4) as f64 * 40.0 + (i / 4) as f64, (i / 4) as f64 * 40.0, 10.0))
///     .collect();
/// let mut mosaic = Mosaic::new(stars.clone(), 2, StackParameters::default()).unwrap();
/// let warper = mosaic.add(&stars, "first.png").unwrap();
/// assert!((warper.apply([40.0, 40.0])[0] - 40.0).abs() < 1e-6);
/// assert_eq!(mosaic.merged_catalog().len(), 16);
/// ```
#[derive(Debug, Clone)]
pub struct Mosaic<H> {
    warper: Warper,
    catalog: Vec<SourcePoint>,
    fit_parameters: FitParameters,
    stacker: Stacker<H>,
}

impl<H> Mosaic<H> {
    /// Starts a mosaic whose common frame is the frame of `reference`.
    ///
    /// # Errors
    /// [`Error::InvalidArgument`](crate::error::Error::InvalidArgument) if `order <= 1`.
    pub fn new(reference: Vec<SourcePoint>, order: usize, parameters: StackParameters) -> Result<Self> {
        Ok(Mosaic {
            warper: Warper::identity(order)?,
            catalog: reference,
            fit_parameters: FitParameters::default(),
            stacker: Stacker::new(parameters),
        })
    }

    pub fn with_fit_parameters(mut self, fit_parameters: FitParameters) -> Self {
        self.fit_parameters = fit_parameters;
        self
    }

    /// Fits the warper of the next exposure and queues it for stacking.
    ///
    /// # Errors
    /// The fit's failure; the mosaic is left unchanged in that case.
    pub fn add(&mut self, catalog: &[SourcePoint], handle: H) -> Result<&Warper> {
        let _span = info_span!("exposure", index = self.stacker.len()).entered();

        let mut warper = self.warper.clone();
        warper.fit_with(&self.catalog, catalog, &self.fit_parameters)?;
        self.catalog = merge_sources(&warper, &self.catalog, catalog, MERGE_RADIUS)?;
        info!(catalog = self.catalog.len(), "registered exposure");

        self.warper = warper.clone();
        self.stacker.add(warper, handle);
        Ok(&self.warper)
    }

    /// The reference catalog with every registered exposure merged in.
    pub fn merged_catalog(&self) -> &[SourcePoint] {
        &self.catalog
    }

    pub fn stacker(&self) -> &Stacker<H> {
        &self.stacker
    }

    pub fn into_stacker(self) -> Stacker<H> {
        self.stacker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn grid(dx: f64, dy: f64) -> Vec<SourcePoint> {
        (0..25)
            .map(|i| {
                let (col, row) = ((i % 5) as f64, (i / 5) as f64);
                SourcePoint::new(col * 50.0 + row * 3.0 + dx, row * 50.0 - col * 2.0 + dy, 20.0 + i as f64)
            })
            .collect()
    }

    #[test]
    fn exposures_are_registered_in_order() {
        let reference = grid(0.0, 0.0);
        let mut mosaic = Mosaic::new(reference.clone(), 2, StackParameters::default()).unwrap();
        mosaic.add(&reference, 'a').unwrap();
        let w = mosaic.add(&grid(-4.0, 2.5), 'b').unwrap().clone();
        assert_abs_diff_eq!(w.fx().coefficient(0, 0), 4.0, epsilon = 1e-6);
        assert_abs_diff_eq!(w.fy().coefficient(0, 0), -2.5, epsilon = 1e-6);

        let handles: Vec<char> = mosaic.stacker().exposures().iter().map(|(_, h)| *h).collect();
        assert_eq!(handles, vec!['a', 'b']);
        // Every star of both exposures matched an existing entry.
        assert_eq!(mosaic.merged_catalog().len(), 25);
        assert_eq!(mosaic.merged_catalog()[0].flux, 60.0);
        assert_eq!(mosaic.into_stacker().len(), 2);
    }

    #[test]
    fn failed_fit_leaves_mosaic_unchanged() {
        let reference = grid(0.0, 0.0);
        let mut mosaic = Mosaic::new(reference.clone(), 2, StackParameters::default()).unwrap();
        let far = vec![SourcePoint::new(5000.0, 5000.0, 1.0)];
        assert!(mosaic.add(&far, 0u8).is_err());
        assert!(mosaic.stacker().is_empty());
        assert_eq!(mosaic.merged_catalog(), &reference[..]);
    }

    #[test]
    fn order_is_validated() {
        assert!(Mosaic::<u8>::new(grid(0.0, 0.0), 1, StackParameters::default()).is_err());
    }
}
