//! # StarStack Library
//!
//! The `starstack` library registers astronomical exposures against each
//! other from their point-source catalogs and co-adds them on a common canvas.
//! Registration fits a pair of bivariate polynomials per exposure from matched
//! stars; stacking inverts those polynomials and resamples every exposure with
//! a Jacobian-adaptive Lanczos kernel.
//!
//! ## Overview of Modules
//!
//! - **`polynomial_surface`**: Defines `PolynomialSurface`, a bivariate polynomial
//!   of bounded total degree with evaluation and analytic partial derivatives.
//!
//! - **`surface_fitter`**: Weighted least-squares accumulation of normal equations for
//!   a `PolynomialSurface`, solved with `nalgebra`'s LU decomposition, plus an
//!   iteratively sigma-clipped fit over a sample grid.
//!
//! - **`spatial_index`**: A static k-d tree with nearest-neighbour and radial queries,
//!   used to pair catalog entries.
//!
//! - **`source`** and **`catalog`**: Point sources, reading and writing of
//!   `x y flux` catalog files, and merging of registered catalogs.
//!
//! - **`matching`**: Offset estimation, nearest-neighbour match lists and sigma
//!   clipping of matches.
//!
//! - **`warper`**: The `Warper`, a polynomial map between exposure frames that fits
//!   itself from two catalogs and can approximate its own inverse.
//!
//! - **`resample`**: Lanczos resampling of one exposure through an inverse warp.
//!
//! - **`stack_pool`**: Per-exposure slices of the output canvas and their reduction
//!   (sum, mean, median, min, max).
//!
//! - **`stacker`**: Orchestrates canvas sizing, loading, resampling and combining of
//!   all registered exposures through caller-supplied `ExposureSource` and
//!   `StackSink` implementations.
//!
//! - **`mosaic`**: Registers a sequence of exposures against a growing reference
//!   catalog and queues them on a `Stacker`.
//!
//! - **`raster`**: Defines a basic `Raster` of `f32` samples where `NaN` marks
//!   missing data.
//!
//! - **`error`**: The library's `Error` type and `Result` alias.

pub mod error;
pub mod raster;

pub mod polynomial_surface;
pub mod surface_fitter;
pub mod spatial_index;

pub mod source;
pub mod catalog;
pub mod matching;
pub mod warper;

pub mod resample;
pub mod stack_pool;
pub mod stacker;
pub mod mosaic;

pub use error::{Error, Result};
