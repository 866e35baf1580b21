use crate::error::{Error, Result};
use crate::matching::{clip_match_list, guess_offset, make_match_list, reference_index, MatchPair};
use crate::polynomial_surface::PolynomialSurface;
use crate::source::SourcePoint;
use crate::surface_fitter::SurfaceFitter;
use rayon::prelude::*;
use tracing::{debug, info, info_span};

/// Tuning values of [`Warper::fit_with`].
#[derive(Debug, Clone, PartialEq)]
pub struct FitParameters {
    /// Number of brightest sources of each catalog used to guess the offset.
    pub brightest_count: usize,
    /// Histogram bin width of the offset guess.
    pub offset_bin_size: f64,
    /// Match radius of the first match list, built after the offset guess.
    pub coarse_match_radius: f64,
    /// Match radius of the final match list.
    pub fine_match_radius: f64,
    /// Matches with a residual above this many standard deviations are dropped.
    pub clipping_sigma: f64,
    /// Fit-and-clip rounds on the coarse match list.
    pub refine_iterations: usize,
}

impl Default for FitParameters {
    fn default() -> Self {
        FitParameters {
            brightest_count: 150,
            offset_bin_size: 1.5,
            coarse_match_radius: 15.0,
            fine_match_radius: 2.5,
            clipping_sigma: 3.0,
            refine_iterations: 3,
        }
    }
}

/// A polynomial map of the plane onto itself, `p ↦ (fx(p), fy(p))`.
///
/// A warper takes positions of an exposure's pixel frame to the common output
/// frame. Both component surfaces share one order `n > 1`, so that at least
/// the affine terms are available.
///
/// # Examples
/// ```
/// # use starstack::warper::Warper;
/// let w = Warper::identity(3).unwrap().translated(2.0, -1.0);
/// assert_eq!(w.apply([10.0, 10.0]), [12.0, 9.0]);
/// assert_eq!(w.deriv1([10.0, 10.0]), [1.0, 0.0]);
/// assert!(Warper::identity(1).is_err());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Warper {
    fx: PolynomialSurface,
    fy: PolynomialSurface,
}

impl Warper {
    /// The identity map of order `order`: `fx = u`, `fy = v`.
    ///
    /// # Errors
    /// [`Error::InvalidArgument`] if `order <= 1`.
    pub fn identity(order: usize) -> Result<Self> {
        check_order(order)?;
        Ok(Warper {
            fx: PolynomialSurface::zero(order).with_coefficient(1, 0, 1.0),
            fy: PolynomialSurface::zero(order).with_coefficient(0, 1, 1.0),
        })
    }

    /// Builds a warper from its two component surfaces.
    ///
    /// # Errors
    /// [`Error::InvalidArgument`] if the orders differ or are `<= 1`.
    pub fn from_surfaces(fx: PolynomialSurface, fy: PolynomialSurface) -> Result<Self> {
        if fx.order() != fy.order() {
            return Err(Error::InvalidArgument(format!(
                "warper surfaces have orders {} and {}",
                fx.order(),
                fy.order()
            )));
        }
        check_order(fx.order())?;
        Ok(Warper { fx, fy })
    }

    /// Returns the warper followed by a translation of `(dx, dy)`.
    pub fn translated(self, dx: f64, dy: f64) -> Self {
        let cx = self.fx.coefficient(0, 0) + dx;
        let cy = self.fy.coefficient(0, 0) + dy;
        Warper {
            fx: self.fx.with_coefficient(0, 0, cx),
            fy: self.fy.with_coefficient(0, 0, cy),
        }
    }

    pub fn order(&self) -> usize {
        self.fx.order()
    }

    pub fn fx(&self) -> &PolynomialSurface {
        &self.fx
    }

    pub fn fy(&self) -> &PolynomialSurface {
        &self.fy
    }

    pub fn apply(&self, p: [f64; 2]) -> [f64; 2] {
        [self.fx.apply(p[0], p[1]), self.fy.apply(p[0], p[1])]
    }

    /// Derivative along the first input axis, `(∂fx/∂u, ∂fy/∂u)`.
    pub fn deriv1(&self, p: [f64; 2]) -> [f64; 2] {
        [self.fx.deriv_u(p[0], p[1]), self.fy.deriv_u(p[0], p[1])]
    }

    /// Derivative along the second input axis, `(∂fx/∂v, ∂fy/∂v)`.
    pub fn deriv2(&self, p: [f64; 2]) -> [f64; 2] {
        [self.fx.deriv_v(p[0], p[1]), self.fy.deriv_v(p[0], p[1])]
    }

    /// Fits the warper so that it maps `source` onto `reference`, using
    /// [`FitParameters::default`].
    pub fn fit(&mut self, reference: &[SourcePoint], source: &[SourcePoint]) -> Result<Vec<MatchPair>> {
        self.fit_with(reference, source, &FitParameters::default())
    }

    /// Fits the warper so that it maps `source` onto `reference`.
    ///
    /// The current state of the warper is the starting guess, which lets a
    /// warper fitted on one exposure seed the fit of the next.
    ///
    /// 1. The gross offset between the catalogs is estimated with
    ///    [`guess_offset`].
    /// 2. Every source point is paired with its nearest reference point after
    ///    removing the offset; pairs beyond `coarse_match_radius` are dropped.
    /// 3. `refine_iterations` times: `fx` and `fy` are fitted independently
    ///    over the pairs, weighted by the product of the fluxes, and pairs with
    ///    a residual above `clipping_sigma` standard deviations are dropped.
    /// 4. The pairs are rebuilt within `fine_match_radius` of the refined
    ///    warper, clipped once more and fitted a last time.
    ///
    /// Returns the final match list. The stages run on a copy, so on failure
    /// the warper is left exactly as it was before the call.
    ///
    /// # Errors
    /// [`Error::InvalidArgument`] if the reference catalog has no finite point,
    /// and [`Error::SingularMatrix`] when too few matches survive to fit a
    /// surface of this order.
    pub fn fit_with(
        &mut self,
        reference: &[SourcePoint],
        source: &[SourcePoint],
        parameters: &FitParameters,
    ) -> Result<Vec<MatchPair>> {
        let _span = info_span!(
            "fit",
            order = self.order(),
            reference = reference.len(),
            source = source.len()
        )
        .entered();

        let index = reference_index(reference)?;
        let offset = guess_offset(
            self,
            reference,
            source,
            parameters.brightest_count,
            parameters.offset_bin_size,
        )?;

        let mut warper = self.clone();
        let mut matches = make_match_list(&warper, &index, source, offset, parameters.coarse_match_radius);
        for round in 0..parameters.refine_iterations {
            warper = warper.fit_matches(&matches)?;
            matches = clip_match_list(&warper, &matches, parameters.clipping_sigma);
            debug!(round, matches = matches.len(), "refined");
        }

        matches = make_match_list(&warper, &index, source, [0.0, 0.0], parameters.fine_match_radius);
        matches = clip_match_list(&warper, &matches, parameters.clipping_sigma);
        *self = warper.fit_matches(&matches)?;

        info!(matches = matches.len(), "fitted warper");
        Ok(matches)
    }

    /// Least-squares fit of both surfaces over `matches`.
    fn fit_matches(&self, matches: &[MatchPair]) -> Result<Warper> {
        let mut x_fitter = SurfaceFitter::new(self.order());
        let mut y_fitter = SurfaceFitter::new(self.order());
        for m in matches {
            let (s, r) = (&m.source, &m.reference);
            x_fitter.add(s.x, s.y, r.x, m.weight());
            y_fitter.add(s.x, s.y, r.y, m.weight());
        }
        Ok(Warper {
            fx: x_fitter.fit()?.clone(),
            fy: y_fitter.fit()?.clone(),
        })
    }

    /// Approximates the inverse map over the rectangle `[min_x, max_x] × [min_y, max_y]`.
    ///
    /// The rectangle is sampled on a regular grid of `steps` intervals per
    /// axis (`steps + 1` nodes, bounds included); every node `p` contributes
    /// the sample `warper(p) ↦ p` to a refit of the same order. The result is
    /// only as good as a polynomial of that order can follow the true inverse,
    /// and only inside the image of the rectangle.
    ///
    /// # Errors
    /// [`Error::InvalidArgument`] if `steps` is zero, and
    /// [`Error::SingularMatrix`] if the warper collapses the rectangle.
    pub fn approximate_inverse(
        &self,
        min_x: f64,
        max_x: f64,
        min_y: f64,
        max_y: f64,
        steps: usize,
    ) -> Result<Warper> {
        if steps == 0 {
            return Err(Error::InvalidArgument("inverse grid needs at least one step".into()));
        }
        let _span = info_span!("invert", order = self.order(), steps).entered();

        let order = self.order();
        let node = |i: usize, min: f64, max: f64| min + (max - min) * i as f64 / steps as f64;
        let (mut x_fitter, mut y_fitter) = (0..=steps)
            .into_par_iter()
            .fold(
                || (SurfaceFitter::new(order), SurfaceFitter::new(order)),
                |(mut x_fitter, mut y_fitter), j| {
                    let y = node(j, min_y, max_y);
                    for i in 0..=steps {
                        let x = node(i, min_x, max_x);
                        let w = self.apply([x, y]);
                        x_fitter.add(w[0], w[1], x, 1.0);
                        y_fitter.add(w[0], w[1], y, 1.0);
                    }
                    (x_fitter, y_fitter)
                },
            )
            .map(Ok::<_, Error>)
            .try_reduce(
                || (SurfaceFitter::new(order), SurfaceFitter::new(order)),
                |(mut ax, mut ay), (bx, by)| {
                    ax.merge(&bx)?;
                    ay.merge(&by)?;
                    Ok((ax, ay))
                },
            )?;

        Warper::from_surfaces(x_fitter.fit()?.clone(), y_fitter.fit()?.clone())
    }
}

fn check_order(order: usize) -> Result<()> {
    if order <= 1 {
        return Err(Error::InvalidArgument(format!(
            "warper order must be greater than 1, got {order}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// A star on every node of a 10 × 10 grid with spacing 100, jittered by
    /// up to 30 pixels, so no two stars are closer than 40 pixels.
    fn star_field(seed: u64) -> Vec<SourcePoint> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut stars = Vec::new();
        for j in 0..10 {
            for i in 0..10 {
                stars.push(SourcePoint::new(
                    50.0 + 100.0 * i as f64 + rng.random_range(-30.0..30.0),
                    50.0 + 100.0 * j as f64 + rng.random_range(-30.0..30.0),
                    rng.random_range(10.0..1000.0),
                ));
            }
        }
        stars
    }

    #[test]
    fn order_must_exceed_one() {
        assert!(matches!(Warper::identity(0), Err(Error::InvalidArgument(_))));
        assert!(matches!(Warper::identity(1), Err(Error::InvalidArgument(_))));
        assert_eq!(Warper::identity(2).unwrap().order(), 2);
    }

    #[test]
    fn surfaces_must_share_order() {
        let r = Warper::from_surfaces(PolynomialSurface::zero(2), PolynomialSurface::zero(3));
        assert!(matches!(r, Err(Error::InvalidArgument(_))));
        let r = Warper::from_surfaces(PolynomialSurface::zero(1), PolynomialSurface::zero(1));
        assert!(matches!(r, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn derivatives_of_quadratic_map() {
        // fx = u + 0.01 u v, fy = 2 v - 0.5 u^2
        let fx = PolynomialSurface::zero(3)
            .with_coefficient(1, 0, 1.0)
            .with_coefficient(1, 1, 0.01);
        let fy = PolynomialSurface::zero(3)
            .with_coefficient(0, 1, 2.0)
            .with_coefficient(2, 0, -0.5);
        let w = Warper::from_surfaces(fx, fy).unwrap();
        let p = [3.0, 4.0];
        assert_abs_diff_eq!(w.apply(p)[0], 3.12, epsilon = 1e-12);
        assert_abs_diff_eq!(w.apply(p)[1], 3.5, epsilon = 1e-12);
        let d1 = w.deriv1(p);
        let d2 = w.deriv2(p);
        assert_abs_diff_eq!(d1[0], 1.04, epsilon = 1e-12);
        assert_abs_diff_eq!(d1[1], -3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(d2[0], 0.03, epsilon = 1e-12);
        assert_abs_diff_eq!(d2[1], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn identical_catalogs_give_identity() {
        let stars = star_field(7);
        let mut warper = Warper::identity(3).unwrap();
        let matches = warper.fit(&stars, &stars).unwrap();
        assert_eq!(matches.len(), stars.len());
        for s in &stars {
            let w = warper.apply(s.position());
            assert_abs_diff_eq!(w[0], s.x, epsilon = 1e-6);
            assert_abs_diff_eq!(w[1], s.y, epsilon = 1e-6);
        }
    }

    #[test]
    fn recovers_small_rotation_and_shift() {
        let source = star_field(42);
        let (c, s) = (0.0005_f64.cos(), 0.0005_f64.sin());
        let reference: Vec<SourcePoint> = source
            .iter()
            .map(|p| SourcePoint::new(c * p.x - s * p.y + 4.2, s * p.x + c * p.y - 3.1, p.flux))
            .collect();

        let mut warper = Warper::identity(2).unwrap();
        let matches = warper.fit(&reference, &source).unwrap();
        assert_eq!(matches.len(), source.len());
        assert_abs_diff_eq!(warper.fx().coefficient(0, 0), 4.2, epsilon = 1e-6);
        assert_abs_diff_eq!(warper.fx().coefficient(1, 0), c, epsilon = 1e-9);
        assert_abs_diff_eq!(warper.fx().coefficient(0, 1), -s, epsilon = 1e-9);
        assert_abs_diff_eq!(warper.fy().coefficient(0, 0), -3.1, epsilon = 1e-6);
        assert_abs_diff_eq!(warper.fy().coefficient(1, 0), s, epsilon = 1e-9);
        assert_abs_diff_eq!(warper.fy().coefficient(0, 1), c, epsilon = 1e-9);
    }

    #[test]
    fn too_few_matches_is_singular() {
        let reference = vec![SourcePoint::new(0.0, 0.0, 1.0), SourcePoint::new(100.0, 0.0, 1.0)];
        let mut warper = Warper::identity(2).unwrap();
        let before = warper.clone();
        assert!(matches!(
            warper.fit(&reference, &reference),
            Err(Error::SingularMatrix { .. })
        ));
        assert_eq!(warper, before);
    }

    #[test]
    fn failed_final_stage_keeps_previous_warper() {
        // The refined affine fit spreads the displaced corner over all four
        // matches, leaving each of them outside the final match radius.
        let reference = vec![
            SourcePoint::new(0.0, 0.0, 1.0),
            SourcePoint::new(100.0, 0.0, 1.0),
            SourcePoint::new(0.0, 100.0, 1.0),
            SourcePoint::new(100.0, 100.0, 1.0),
        ];
        let mut source = reference.clone();
        source[3].x += 12.0;

        let mut warper = Warper::identity(2).unwrap().translated(0.25, -0.25);
        let before = warper.clone();
        assert!(matches!(
            warper.fit(&reference, &source),
            Err(Error::SingularMatrix { samples: 0, .. })
        ));
        assert_eq!(warper, before);
    }

    #[test]
    fn non_finite_fluxes_are_ignored() {
        let stars = star_field(11);
        let mut reference: Vec<SourcePoint> = (0..200)
            .map(|i| SourcePoint::new(i as f64 * 5.0, 3.0, f64::NAN))
            .collect();
        reference.extend(stars.iter().copied());

        let mut warper = Warper::identity(2).unwrap();
        let matches = warper.fit(&reference, &stars).unwrap();
        assert_eq!(matches.len(), stars.len());
        assert!(matches.iter().all(|m| m.reference.is_finite()));
        assert_abs_diff_eq!(warper.apply([500.0, 500.0])[0], 500.0, epsilon = 1e-6);
    }

    #[test]
    fn empty_reference_is_rejected() {
        let mut warper = Warper::identity(2).unwrap();
        assert!(matches!(
            warper.fit(&[], &star_field(1)),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn inverse_undoes_quadratic_map() {
        let fx = PolynomialSurface::zero(3)
            .with_coefficient(0, 0, 12.0)
            .with_coefficient(1, 0, 1.01)
            .with_coefficient(0, 1, 0.02)
            .with_coefficient(2, 0, 1e-6);
        let fy = PolynomialSurface::zero(3)
            .with_coefficient(0, 0, -7.0)
            .with_coefficient(1, 0, -0.015)
            .with_coefficient(0, 1, 0.99)
            .with_coefficient(1, 1, -2e-6);
        let forward = Warper::from_surfaces(fx, fy).unwrap();
        let inverse = forward.approximate_inverse(0.0, 400.0, 0.0, 300.0, 100).unwrap();
        assert_eq!(inverse.order(), 3);
        for &p in &[[0.0, 0.0], [200.0, 150.0], [390.0, 20.0], [35.0, 280.0]] {
            let back = inverse.apply(forward.apply(p));
            assert_abs_diff_eq!(back[0], p[0], epsilon = 0.05);
            assert_abs_diff_eq!(back[1], p[1], epsilon = 0.05);
        }
    }

    #[test]
    fn inverse_of_affine_map_is_exact() {
        let forward = Warper::identity(2).unwrap().translated(-5.0, 8.0);
        let inverse = forward.approximate_inverse(0.0, 64.0, 0.0, 32.0, 10).unwrap();
        assert_abs_diff_eq!(inverse.fx().coefficient(0, 0), 5.0, epsilon = 1e-9);
        assert_abs_diff_eq!(inverse.fy().coefficient(0, 0), -8.0, epsilon = 1e-9);
        assert_abs_diff_eq!(inverse.fx().coefficient(1, 0), 1.0, epsilon = 1e-12);
        assert!(forward.approximate_inverse(0.0, 1.0, 0.0, 1.0, 0).is_err());
    }
}
