/// A point source extracted from an exposure: its centroid `(x, y)` in pixel
/// coordinates and its integrated flux.
///
/// Sources serve both as geometric samples for registration and, through
/// their flux, as fit weights.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct SourcePoint {
    pub x: f64,
    pub y: f64,
    /// Integrated flux; expected to be non-negative.
    pub flux: f64,
}

impl SourcePoint {
    pub fn new(x: f64, y: f64, flux: f64) -> Self {
        SourcePoint { x, y, flux }
    }

    /// The position as a coordinate array, as used by the spatial index.
    pub fn position(&self) -> [f64; 2] {
        [self.x, self.y]
    }

    /// `true` when position and flux are all finite.
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.flux.is_finite()
    }
}
