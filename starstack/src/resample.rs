//! Resampling of an exposure onto the output canvas.
//!
//! Each output pixel is pulled back into the exposure through an inverse warp
//! and interpolated with a radially symmetric Lanczos kernel. The kernel
//! footprint follows the local Jacobian of the inverse warp, so a rotated or
//! rescaled exposure is filtered in the output frame rather than in its own.

use crate::raster::Raster;
use crate::warper::Warper;
use rayon::prelude::*;
use std::f64::consts::PI;

/// Placement of the output canvas in the common frame: output pixel `(x, y)`
/// sits at `(x + origin[0], y + origin[1])`.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Canvas {
    pub origin: [f64; 2],
    pub width: usize,
    pub height: usize,
}

impl Canvas {
    /// Common-frame position of output pixel `(x, y)`.
    pub fn position(&self, x: usize, y: usize) -> [f64; 2] {
        [x as f64 + self.origin[0], y as f64 + self.origin[1]]
    }
}

/// Normalized sinc, `sin(πx) / (πx)`.
pub fn sinc(x: f64) -> f64 {
    if x == 0.0 {
        1.0
    } else {
        let px = PI * x;
        px.sin() / px
    }
}

/// Lanczos window of order `order` at distance `r`: `sinc(r) · sinc(r / order)`
/// inside the window, zero outside.
///
/// # Examples
/// ```
/// # use starstack::resample::lanczos_kernel;
/// assert_eq!(lanczos_kernel(0.0, 2), 1.0);
/// assert!(lanczos_kernel(1.0, 2).abs() < 1e-15);
/// assert_eq!(lanczos_kernel(2.5, 2), 0.0);
/// ```
pub fn lanczos_kernel(r: f64, order: usize) -> f64 {
    let a = order as f64;
    if r == 0.0 {
        1.0
    } else if r.abs() > a {
        0.0
    } else {
        sinc(r) * sinc(r / a)
    }
}

/// Interpolates `source` at the pull-back of output position `p`.
///
/// `inverse` maps output positions to source pixel coordinates. Every source
/// pixel near the pulled-back position is weighted by the Lanczos kernel at
/// the length of its offset carried back into the output frame by the inverse
/// of the local Jacobian `(d1, d2)`, the inverse warp's derivatives at `p`.
/// Where the warp magnifies, that length is capped by the offset in source
/// pixels, so the kernel never gets narrower than one source pixel. The
/// window therefore extends `order · max(1, |d1| + |d2|)` on each axis.
/// Pixels outside `source` and non-finite samples are skipped.
///
/// Returns `NaN` when no pixel contributes or the Jacobian is singular.
pub fn resample_pixel(source: &Raster, inverse: &Warper, p: [f64; 2], order: usize) -> f64 {
    let [u, v] = inverse.apply(p);
    let d1 = inverse.deriv1(p);
    let d2 = inverse.deriv2(p);
    let det = d1[0] * d2[1] - d2[0] * d1[1];
    if !(u.is_finite() && v.is_finite() && det.is_finite()) || det == 0.0 {
        return f64::NAN;
    }

    let k = order as f64;
    let reach_u = k * (d1[0].abs() + d2[0].abs()).max(1.0);
    let reach_v = k * (d1[1].abs() + d2[1].abs()).max(1.0);
    let (first_u, last_u) = ((u - reach_u).ceil() as isize, (u + reach_u).floor() as isize);
    let (first_v, last_v) = ((v - reach_v).ceil() as isize, (v + reach_v).floor() as isize);

    let mut sum = 0.0;
    let mut weight_sum = 0.0;
    for j in first_v..=last_v {
        for i in first_u..=last_u {
            let Some(z) = source.get_checked(i, j) else {
                continue;
            };
            if !z.is_finite() {
                continue;
            }
            let (du, dv) = (i as f64 - u, j as f64 - v);
            let dx = (d2[1] * du - d2[0] * dv) / det;
            let dy = (d1[0] * dv - d1[1] * du) / det;
            let r = dx.hypot(dy).min(du.hypot(dv));
            let w = lanczos_kernel(r, order);
            sum += w * z as f64;
            weight_sum += w;
        }
    }

    if weight_sum.abs() > f64::EPSILON {
        sum / weight_sum
    } else {
        f64::NAN
    }
}

/// Resamples `source` onto `canvas` through `inverse`, one output row per task.
///
/// Canvas pixels that the exposure does not cover are `NaN`.
pub fn warp_raster(source: &Raster, inverse: &Warper, canvas: &Canvas, order: usize) -> Raster {
    let mut out = Raster::filled(canvas.width, canvas.height, f32::NAN);
    if canvas.width == 0 {
        return out;
    }
    out.data
        .par_chunks_mut(canvas.width)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, value) in row.iter_mut().enumerate() {
                *value = resample_pixel(source, inverse, canvas.position(x, y), order) as f32;
            }
        });
    out
}
