use crate::error::{Error, Result};
use crate::polynomial_surface::{term_count, PolynomialSurface};
use crate::raster::Raster;
use nalgebra::{DMatrix, DVector};
use tracing::debug;

/// Smallest pivot (relative to the unit diagonal of the equilibrated normal
/// matrix) accepted by [`SurfaceFitter::fit`].
const PIVOT_TOLERANCE: f64 = 1e-12;

/// Residuals at or below this magnitude are never clipped, so that an exact
/// fit (stddev ≈ 0) does not reject its own samples over rounding noise.
const MIN_CLIP_LIMIT: f64 = 1e-4;

/// Weighted least-squares fitter for a [`PolynomialSurface`].
///
/// Samples are folded into the normal equations `(AᵀWA)c = AᵀWz` as they are
/// added, so memory stays at `m × m` for `m = n(n+1)/2` unknowns regardless of
/// the number of samples. Fitters of the same order can be built on separate
/// threads and combined with [`SurfaceFitter::merge`] before calling
/// [`SurfaceFitter::fit`].
///
/// # Examples
/// ```
/// # use starstack::surface_fitter::SurfaceFitter;
/// // z = 1 + 2x - y
/// let mut fitter = SurfaceFitter::new(2);
/// for &(x, y) in &[(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (2.0, 3.0)] {
///     fitter.add(x, y, 1.0 + 2.0 * x - y, 1.0);
/// }
/// let surface = fitter.fit().unwrap();
/// assert!((surface.coefficient(1, 0) - 2.0).abs() < 1e-9);
/// assert!((fitter.at(5.0, 5.0) - 6.0).abs() < 1e-9);
/// ```
#[derive(Debug, Clone)]
pub struct SurfaceFitter {
    order: usize,
    normal: DMatrix<f64>,
    rhs: DVector<f64>,
    count: usize,
    surface: PolynomialSurface,
    monomials: Vec<f64>,
}

impl SurfaceFitter {
    /// Creates an empty fitter for surfaces of order `order`.
    pub fn new(order: usize) -> Self {
        let m = term_count(order);
        SurfaceFitter {
            order,
            normal: DMatrix::zeros(m, m),
            rhs: DVector::zeros(m),
            count: 0,
            surface: PolynomialSurface::zero(order),
            monomials: vec![0.0; m],
        }
    }

    pub fn order(&self) -> usize {
        self.order
    }

    /// Number of samples added so far (merged fitters included).
    pub fn sample_count(&self) -> usize {
        self.count
    }

    /// Adds the sample `z` observed at `(x, y)` with the given weight.
    ///
    /// Every entry `(k, l)` of the normal matrix grows by
    /// `weight · x^p1 y^q1 · x^p2 y^q2` and entry `k` of the right-hand side by
    /// `weight · z · x^p1 y^q1`, with `k`, `l` the
    /// [`term_index`](crate::polynomial_surface::term_index) of `(p1, q1)` and `(p2, q2)`.
    pub fn add(&mut self, x: f64, y: f64, z: f64, weight: f64) {
        let n = self.order;
        let m = self.monomials.len();

        let mut k = 0;
        let mut up = 1.0;
        for p in 0..n {
            let mut vq = 1.0;
            for _q in 0..n - p {
                self.monomials[k] = up * vq;
                vq *= y;
                k += 1;
            }
            up *= x;
        }

        for k in 0..m {
            let wk = weight * self.monomials[k];
            for l in 0..m {
                self.normal[(k, l)] += wk * self.monomials[l];
            }
            self.rhs[k] += wk * z;
        }
        self.count += 1;
    }

    /// Adds the accumulated samples of `other` to this fitter.
    ///
    /// Normal equations are additive, so merging partial fitters built on
    /// disjoint sample sets gives the same system as adding all samples to one.
    ///
    /// # Errors
    /// [`Error::InvalidArgument`] if the two fitters have different orders.
    pub fn merge(&mut self, other: &SurfaceFitter) -> Result<()> {
        if other.order != self.order {
            return Err(Error::InvalidArgument(format!(
                "cannot merge fitters of order {} and {}",
                self.order, other.order
            )));
        }
        self.absorb(other);
        Ok(())
    }

    fn absorb(&mut self, other: &SurfaceFitter) {
        self.normal += &other.normal;
        self.rhs += &other.rhs;
        self.count += other.count;
    }

    /// Solves the normal equations and stores the resulting surface.
    ///
    /// The system is equilibrated by its diagonal and factorized with LU
    /// decomposition (partial pivoting).
    ///
    /// # Errors
    /// [`Error::SingularMatrix`] when the samples do not determine every
    /// coefficient: too few samples, samples on a curve of the basis, or a
    /// basis function that vanishes on every sample.
    pub fn fit(&mut self) -> Result<&PolynomialSurface> {
        let m = self.rhs.len();
        let (order, samples) = (self.order, self.count);
        let singular = move || Error::SingularMatrix { order, samples };

        let mut scale = DVector::zeros(m);
        for i in 0..m {
            let d = self.normal[(i, i)];
            if !(d > 0.0 && d.is_finite()) {
                return Err(singular());
            }
            scale[i] = 1.0 / d.sqrt();
        }
        let scaled = DMatrix::from_fn(m, m, |i, j| self.normal[(i, j)] * scale[i] * scale[j]);
        let rhs = DVector::from_fn(m, |i, _| self.rhs[i] * scale[i]);

        let lu = scaled.lu();
        let u = lu.u();
        let min_pivot = (0..m).map(|i| u[(i, i)].abs()).fold(f64::INFINITY, f64::min);
        if !(min_pivot > PIVOT_TOLERANCE) {
            debug!(min_pivot, samples, "rejecting singular normal equations");
            return Err(singular());
        }
        let solution = lu.solve(&rhs).ok_or_else(singular)?;

        let coefficients: Vec<f64> = (0..m).map(|i| solution[i] * scale[i]).collect();
        if coefficients.iter().any(|c| !c.is_finite()) {
            return Err(singular());
        }
        self.surface =
            PolynomialSurface::from_coefficients(order, coefficients).ok_or_else(singular)?;
        Ok(&self.surface)
    }

    /// The most recently fitted surface (all zeros before the first fit).
    pub fn surface_coefficients(&self) -> &PolynomialSurface {
        &self.surface
    }

    /// Evaluates the fitted surface at `(x, y)`.
    pub fn at(&self, x: f64, y: f64) -> f64 {
        self.surface.apply(x, y)
    }

    /// Evaluates the fitted surface on a regular `width` × `height` grid.
    ///
    /// Pixel `i` of an axis maps to `t = i / extent` and the coordinate
    /// `t · max + (1 - t) · min`, so pixel 0 samples `min` exactly and the last
    /// pixel stops one step short of `max`; samples are not pixel-centered.
    ///
    /// # Examples
    /// ```
    /// # use starstack::surface_fitter::SurfaceFitter;
    /// let mut fitter = SurfaceFitter::new(2);
    /// for &(x, y) in &[(0.0, 0.0), (1.0, 0.0), (0.0, 1.0)] {
    ///     fitter.add(x, y, x, 1.0);
    /// }
    /// fitter.fit().unwrap();
    /// let grid = fitter.surface(0.0, 8.0, 0.0, 4.0, 4, 2);
    /// assert!((grid.get(1, 0) - 2.0).abs() < 1e-6);
    /// assert!((grid.get(3, 1) - 6.0).abs() < 1e-6);
    /// ```
    pub fn surface(
        &self,
        min_x: f64,
        max_x: f64,
        min_y: f64,
        max_y: f64,
        width: usize,
        height: usize,
    ) -> Raster {
        let mut out = Raster::new(width, height);
        for yi in 0..height {
            let t = yi as f64 / height as f64;
            let y = t * max_y + (1.0 - t) * min_y;
            for xi in 0..width {
                let t = xi as f64 / width as f64;
                let x = t * max_x + (1.0 - t) * min_x;
                out.set(xi, yi, self.at(x, y) as f32);
            }
        }
        out
    }

    /// Fits a surface to a sample grid with iterative sigma clipping.
    ///
    /// The fit is repeated `repeat + 1` times. Each round builds a fresh fitter
    /// from every `step`-th finite sample along both axes (sample `(x, y)` sits
    /// at coordinate `(x, y)`), fits it, and, before the next round, excludes
    /// every sample whose residual exceeds `clipping_sigma` times the standard
    /// deviation of all finite residuals. The input grid is left untouched.
    ///
    /// # Errors
    /// [`Error::InvalidArgument`] when `step` is zero, and
    /// [`Error::SingularMatrix`] when a round has too few usable samples.
    pub fn iterative_fit(
        grid: &Raster,
        order: usize,
        clipping_sigma: f64,
        repeat: usize,
        step: usize,
    ) -> Result<SurfaceFitter> {
        if step == 0 {
            return Err(Error::InvalidArgument("sampling step must be positive".into()));
        }
        let mut section = grid.clone();
        let mut round = 0;

        loop {
            let mut fitter = SurfaceFitter::new(order);
            for y in (0..section.height).step_by(step) {
                for x in (0..section.width).step_by(step) {
                    let z = section.get(x, y);
                    if z.is_finite() {
                        fitter.add(x as f64, y as f64, z as f64, 1.0);
                    }
                }
            }
            fitter.fit()?;
            if round == repeat {
                return Ok(fitter);
            }

            let residuals: Vec<f64> = section
                .data
                .iter()
                .enumerate()
                .map(|(i, &z)| {
                    let (x, y) = (i % section.width, i / section.width);
                    z as f64 - fitter.at(x as f64, y as f64)
                })
                .collect();
            let Some(sigma) = stddev(residuals.iter().copied()) else {
                return Ok(fitter);
            };
            let limit = clip_limit(clipping_sigma, sigma);
            let mut clipped = 0;
            for (sample, residual) in section.data.iter_mut().zip(&residuals) {
                if residual.abs() > limit {
                    *sample = f32::NAN;
                    clipped += 1;
                }
            }
            debug!(round, sigma, clipped, "clipped grid samples");
            round += 1;
        }
    }
}

/// Population standard deviation of the finite values, or `None` if there are none.
pub(crate) fn stddev<I: IntoIterator<Item = f64>>(values: I) -> Option<f64> {
    let (mut n, mut mean, mut m2) = (0usize, 0.0, 0.0);
    for v in values.into_iter().filter(|v| v.is_finite()) {
        n += 1;
        let delta = v - mean;
        mean += delta / n as f64;
        m2 += delta * (v - mean);
    }
    (n > 0).then(|| (m2 / n as f64).sqrt())
}

/// Residual magnitude above which a sample is rejected.
pub(crate) fn clip_limit(clipping_sigma: f64, stddev: f64) -> f64 {
    (clipping_sigma * stddev).max(MIN_CLIP_LIMIT)
}
