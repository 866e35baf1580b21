/// Number of coefficients of a surface of order `n`, i.e. the count of
/// `(p, q)` pairs with `p + q < n`.
pub fn term_count(order: usize) -> usize {
    order * (order + 1) / 2
}

/// Linear index of the `(p, q)` term of an order-`n` surface.
///
/// Terms are enumerated row-major by increasing `p`, then `q`:
/// `k(p, q) = Σ_{i<p} (n - i) + q`.
///
/// # Examples
/// ```
/// # use starstack::polynomial_surface::term_index;
/// // order 3: (0,0) (0,1) (0,2) (1,0) (1,1) (2,0)
/// assert_eq!(term_index(3, 0, 2), 2);
/// assert_eq!(term_index(3, 1, 0), 3);
/// assert_eq!(term_index(3, 2, 0), 5);
/// ```
pub fn term_index(order: usize, p: usize, q: usize) -> usize {
    debug_assert!(p + q < order);
    p * order - p * p.saturating_sub(1) / 2 + q
}

/// A bivariate polynomial truncated to total degree `n - 1`:
///
/// ```text
///   f(u, v) = Σ_{p+q<n} A(p, q) · u^p · v^q
/// ```
///
/// `n` is called the *order* of the surface. Only the triangular block of
/// coefficients with `p + q < n` is stored; every other coefficient is zero.
/// Surfaces are plain values: they are produced by a
/// [`SurfaceFitter`](crate::surface_fitter::SurfaceFitter) or built with
/// [`PolynomialSurface::from_fn`] and not mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct PolynomialSurface {
    order: usize,
    coefficients: Vec<f64>,
}

impl PolynomialSurface {
    /// Creates an order-`order` surface whose coefficients are all zero.
    pub fn zero(order: usize) -> Self {
        PolynomialSurface {
            order,
            coefficients: vec![0.0; term_count(order)],
        }
    }

    /// Creates a surface whose coefficient `(p, q)` is `f(p, q)`.
    ///
    /// # Examples
    /// ```
    /// # use starstack::polynomial_surface::PolynomialSurface;
    /// // f(u, v) = 1 + 2u + 3v
    /// let s = PolynomialSurface::from_fn(2, |p, q| match (p, q) {
    ///     (0, 0) => 1.0,
    ///     (1, 0) => 2.0,
    ///     _ => 3.0,
    /// });
    /// assert_eq!(s.apply(1.0, 1.0), 6.0);
    /// ```
    pub fn from_fn<F: FnMut(usize, usize) -> f64>(order: usize, mut f: F) -> Self {
        let mut coefficients = Vec::with_capacity(term_count(order));
        for p in 0..order {
            for q in 0..order - p {
                coefficients.push(f(p, q));
            }
        }
        PolynomialSurface {
            order,
            coefficients,
        }
    }

    /// Builds a surface from coefficients laid out in [`term_index`] order.
    ///
    /// Returns `None` if the slice length does not match the order.
    pub fn from_coefficients(order: usize, coefficients: Vec<f64>) -> Option<Self> {
        if coefficients.len() != term_count(order) {
            return None;
        }
        Some(PolynomialSurface {
            order,
            coefficients,
        })
    }

    /// Returns a copy of the surface with coefficient `(p, q)` replaced.
    ///
    /// # Panics
    /// Panics if `p + q >= order`.
    pub(crate) fn with_coefficient(mut self, p: usize, q: usize, value: f64) -> Self {
        assert!(p + q < self.order, "term ({p}, {q}) outside order {}", self.order);
        let k = term_index(self.order, p, q);
        self.coefficients[k] = value;
        self
    }

    pub fn order(&self) -> usize {
        self.order
    }

    /// Coefficient `A(p, q)`; zero outside the triangular support.
    pub fn coefficient(&self, p: usize, q: usize) -> f64 {
        if p + q < self.order {
            self.coefficients[term_index(self.order, p, q)]
        } else {
            0.0
        }
    }

    /// All coefficients in [`term_index`] order.
    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    /// Evaluates the surface at `(u, v)`.
    ///
    /// Powers of `u` and `v` are accumulated incrementally instead of being
    /// recomputed for every term.
    pub fn apply(&self, u: f64, v: f64) -> f64 {
        let n = self.order;
        let mut s = 0.0;
        let mut k = 0;
        let mut up = 1.0;
        for p in 0..n {
            let mut vq = 1.0;
            for _q in 0..n - p {
                s += self.coefficients[k] * up * vq;
                vq *= v;
                k += 1;
            }
            up *= u;
        }
        s
    }

    /// Partial derivative `∂f/∂u` at `(u, v)`: `Σ p·A(p, q)·u^(p-1)·v^q`.
    pub fn deriv_u(&self, u: f64, v: f64) -> f64 {
        let n = self.order;
        let mut s = 0.0;
        let mut k = 0;
        // u^(p-1); the p = 0 row contributes nothing.
        let mut last_up = 0.0;
        let mut up = 1.0;
        for p in 0..n {
            let mut vq = 1.0;
            for _q in 0..n - p {
                s += p as f64 * self.coefficients[k] * last_up * vq;
                vq *= v;
                k += 1;
            }
            last_up = up;
            up *= u;
        }
        s
    }

    /// Partial derivative `∂f/∂v` at `(u, v)`: `Σ q·A(p, q)·u^p·v^(q-1)`.
    pub fn deriv_v(&self, u: f64, v: f64) -> f64 {
        let n = self.order;
        let mut s = 0.0;
        let mut k = 0;
        let mut up = 1.0;
        for p in 0..n {
            let mut last_vq = 0.0;
            let mut vq = 1.0;
            for q in 0..n - p {
                s += q as f64 * self.coefficients[k] * up * last_vq;
                last_vq = vq;
                vq *= v;
                k += 1;
            }
            up *= u;
        }
        s
    }
}
