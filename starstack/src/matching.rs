//! Candidate correspondences between a source catalog and a reference catalog.
//!
//! These are the building blocks of [`Warper::fit_with`](crate::warper::Warper::fit_with):
//! a histogram estimate of the gross offset between the catalogs, nearest
//! neighbour match lists, and sigma clipping of those lists against the
//! current warper.

use crate::catalog::brightest;
use crate::error::Result;
use crate::source::SourcePoint;
use crate::spatial_index::SpatialIndex;
use crate::surface_fitter::{clip_limit, stddev};
use crate::warper::Warper;
use std::collections::BTreeMap;
use tracing::{debug, debug_span};

/// A reference source paired with the source-catalog point believed to be
/// the same object.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct MatchPair {
    pub reference: SourcePoint,
    pub source: SourcePoint,
}

impl MatchPair {
    /// Weight of the pair in a surface fit: the product of both fluxes.
    pub fn weight(&self) -> f64 {
        self.reference.flux * self.source.flux
    }

    /// Residual `reference - warper(source)` on each axis.
    pub fn residual(&self, warper: &Warper) -> [f64; 2] {
        let w = warper.apply(self.source.position());
        [self.reference.x - w[0], self.reference.y - w[1]]
    }
}

/// Builds a spatial index over the finite points of a catalog.
///
/// # Errors
/// [`Error::InvalidArgument`](crate::error::Error::InvalidArgument) if the
/// catalog has no finite point.
pub fn reference_index(reference: &[SourcePoint]) -> Result<SpatialIndex<SourcePoint, 2>> {
    SpatialIndex::build(
        reference
            .iter()
            .filter(|r| r.is_finite())
            .map(|r| (*r, r.position()))
            .collect(),
    )
}

/// Estimates the offset between where `warper` puts the source points and
/// where their reference counterparts are.
///
/// Only the `brightest_count` brightest finite points of each catalog take part.
/// Every source point is mapped through `warper` and paired with its nearest
/// reference point; the residuals `mapped - reference` are binned into
/// `bin_size` wide histograms, one per axis, and the centre of the most
/// populated bin of each histogram is returned. The two axes are estimated
/// independently, so the result is an axis-wise mode rather than a 2D mode.
///
/// # Errors
/// [`Error::InvalidArgument`](crate::error::Error::InvalidArgument) if the
/// reference catalog has no finite point.
pub fn guess_offset(
    warper: &Warper,
    reference: &[SourcePoint],
    source: &[SourcePoint],
    brightest_count: usize,
    bin_size: f64,
) -> Result<[f64; 2]> {
    let _span = debug_span!("guess_offset").entered();

    let index = reference_index(&brightest(reference, brightest_count))?;
    let mut histograms = [BTreeMap::<i64, usize>::new(), BTreeMap::new()];
    for s in &brightest(source, brightest_count) {
        let w = warper.apply(s.position());
        let r = index.nearest(&w);
        for (axis, histogram) in histograms.iter_mut().enumerate() {
            let d = w[axis] - r.position()[axis];
            if d.is_finite() {
                *histogram.entry((d / bin_size).round() as i64).or_default() += 1;
            }
        }
    }

    let mut offset = [0.0; 2];
    for (axis, histogram) in histograms.iter().enumerate() {
        // Ties go to the lowest bin so the estimate is deterministic.
        let mut best: Option<(i64, usize)> = None;
        for (&bin, &count) in histogram {
            if best.map_or(true, |(_, c)| count > c) {
                best = Some((bin, count));
            }
        }
        if let Some((bin, _)) = best {
            offset[axis] = bin as f64 * bin_size;
        }
    }
    debug!(dx = offset[0], dy = offset[1], "estimated offset");
    Ok(offset)
}

/// Pairs every finite source point with its nearest reference point.
///
/// A source point `s` is looked up at `warper(s - offset)`; pairs further apart
/// than `match_radius` are discarded.
pub fn make_match_list(
    warper: &Warper,
    index: &SpatialIndex<SourcePoint, 2>,
    source: &[SourcePoint],
    offset: [f64; 2],
    match_radius: f64,
) -> Vec<MatchPair> {
    let r2 = match_radius * match_radius;
    let matches: Vec<MatchPair> = source
        .iter()
        .filter(|s| s.is_finite())
        .filter_map(|s| {
            let w = warper.apply([s.x - offset[0], s.y - offset[1]]);
            let reference = index.nearest(&w);
            let d2 = (w[0] - reference.x).powi(2) + (w[1] - reference.y).powi(2);
            (d2 <= r2).then_some(MatchPair {
                reference: *reference,
                source: *s,
            })
        })
        .collect();
    debug!(radius = match_radius, matches = matches.len(), "built match list");
    matches
}

/// Drops the pairs whose residual against `warper` exceeds `clipping_sigma`
/// standard deviations on either axis.
///
/// The standard deviation is computed per axis over the whole list.
pub fn clip_match_list(warper: &Warper, matches: &[MatchPair], clipping_sigma: f64) -> Vec<MatchPair> {
    let residuals: Vec<[f64; 2]> = matches.iter().map(|m| m.residual(warper)).collect();
    let (Some(sx), Some(sy)) = (
        stddev(residuals.iter().map(|r| r[0])),
        stddev(residuals.iter().map(|r| r[1])),
    ) else {
        return Vec::new();
    };
    let (limit_x, limit_y) = (clip_limit(clipping_sigma, sx), clip_limit(clipping_sigma, sy));

    let kept: Vec<MatchPair> = matches
        .iter()
        .zip(&residuals)
        .filter(|(_, r)| r[0].abs() <= limit_x && r[1].abs() <= limit_y)
        .map(|(m, _)| *m)
        .collect();
    debug!(sx, sy, kept = kept.len(), dropped = matches.len() - kept.len(), "clipped match list");
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn triangle() -> Vec<SourcePoint> {
        vec![
            SourcePoint::new(10.0, 10.0, 100.0),
            SourcePoint::new(20.0, 10.0, 50.0),
            SourcePoint::new(10.0, 20.0, 80.0),
        ]
    }

    fn shifted(points: &[SourcePoint], dx: f64, dy: f64) -> Vec<SourcePoint> {
        points.iter().map(|p| SourcePoint::new(p.x + dx, p.y + dy, p.flux)).collect()
    }

    #[test]
    fn offset_is_binned_per_axis() {
        let identity = Warper::identity(2).unwrap();
        let reference = triangle();
        let source = shifted(&reference, -2.0, -3.0);
        let offset = guess_offset(&identity, &reference, &source, 150, 1.5).unwrap();
        // -2 / 1.5 rounds to bin -1, -3 / 1.5 is bin -2.
        assert_abs_diff_eq!(offset[0], -1.5);
        assert_abs_diff_eq!(offset[1], -3.0);
    }

    #[test]
    fn offset_needs_a_reference() {
        let identity = Warper::identity(2).unwrap();
        assert!(guess_offset(&identity, &[], &triangle(), 150, 1.5).is_err());
    }

    #[test]
    fn unusable_fluxes_do_not_crowd_out_stars() {
        let identity = Warper::identity(2).unwrap();
        let mut reference: Vec<SourcePoint> = (0..150).map(|i| SourcePoint::new(i as f64, 50.0, f64::NAN)).collect();
        reference.extend(triangle());
        let source = shifted(&triangle(), -2.0, -3.0);
        let offset = guess_offset(&identity, &reference, &source, 150, 1.5).unwrap();
        assert_abs_diff_eq!(offset[0], -1.5);
        assert_abs_diff_eq!(offset[1], -3.0);
    }

    #[test]
    fn match_list_respects_radius_and_offset() {
        let identity = Warper::identity(2).unwrap();
        let reference = triangle();
        let index = reference_index(&reference).unwrap();
        let mut source = shifted(&reference, -2.0, -3.0);
        source.push(SourcePoint::new(f64::NAN, 1.0, 1.0));

        assert_eq!(make_match_list(&identity, &index, &source, [0.0, 0.0], 3.0).len(), 0);
        let matches = make_match_list(&identity, &index, &source, [-2.0, -3.0], 0.5);
        assert_eq!(matches.len(), 3);
        for m in &matches {
            assert_eq!(m.residual(&identity), [2.0, 3.0]);
        }
    }

    #[test]
    fn clipping_removes_gross_outlier() {
        let identity = Warper::identity(2).unwrap();
        let mut matches: Vec<MatchPair> = (0..30)
            .map(|i| {
                let s = SourcePoint::new(i as f64 * 10.0, (i % 5) as f64 * 10.0, 1.0);
                let jitter = if i % 2 == 0 { 0.1 } else { -0.1 };
                let r = SourcePoint::new(s.x + jitter, s.y - jitter, 1.0);
                MatchPair { reference: r, source: s }
            })
            .collect();
        matches.push(MatchPair {
            reference: SourcePoint::new(5.0, 5.0, 1.0),
            source: SourcePoint::new(12.0, 5.0, 1.0),
        });

        let kept = clip_match_list(&identity, &matches, 3.0);
        assert_eq!(kept.len(), 30);
        assert!(kept.iter().all(|m| m.residual(&identity)[0].abs() < 1.0));
    }

    #[test]
    fn exact_matches_survive_clipping() {
        let identity = Warper::identity(3).unwrap();
        let matches: Vec<MatchPair> = triangle()
            .into_iter()
            .map(|p| MatchPair { reference: p, source: p })
            .collect();
        assert_eq!(clip_match_list(&identity, &matches, 3.0), matches);
        assert!(clip_match_list(&identity, &[], 3.0).is_empty());
    }
}
