//! Geometric and photometric transforms fitted by the calibration.
//!
//! Geometric transforms map 2D positions (pixel → focal plane → tangent
//! plane) and photometric transforms map an instrumental value (flux or
//! magnitude) at a position to a calibrated value. Both expose a flat
//! parameter vector, parameter derivatives and an additive parameter update,
//! which is all the least-squares engine needs.
//!
//! # Geometric variants
//!
//! - [`AstrometryTransform::Identity`]: no parameters
//! - [`AstrometryTransform::Shift`]: pure translation (2 parameters)
//! - [`AstrometryTransform::Linear`]: affine map (6 parameters)
//! - [`AstrometryTransform::Polynomial`]: full bivariate polynomial
//!
//! Composition folds into a single variant instead of wrapping: shifts and
//! linear maps compose into a linear map, and anything involving a
//! polynomial becomes one polynomial through exact substitution.

pub mod photometry;
pub mod polynomial;
pub mod sip;

pub use photometry::{PhotometryPolynomial, PhotometryTransform};
pub use polynomial::AstrometryPolynomial;
pub use sip::{SipWcs, SkyWcs};

use nalgebra::{DMatrix, Matrix2};

use crate::error::{JointcalError, Result};
use crate::geom::{Frame, Point};

/// Affine map `x' = dx + a11·x + a12·y`, `y' = dy + a21·x + a22·y`.
///
/// Parameters are ordered `[dx, a11, a12, dy, a21, a22]`, which is the layout
/// of an order-1 [`AstrometryPolynomial`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearTransform {
    pub dx: f64,
    pub dy: f64,
    pub a11: f64,
    pub a12: f64,
    pub a21: f64,
    pub a22: f64,
}

impl LinearTransform {
    pub fn new(dx: f64, dy: f64, a11: f64, a12: f64, a21: f64, a22: f64) -> Self {
        Self {
            dx,
            dy,
            a11,
            a12,
            a21,
            a22,
        }
    }

    pub fn identity() -> Self {
        Self::new(0.0, 0.0, 1.0, 0.0, 0.0, 1.0)
    }

    /// Map `frame` onto `[-1, 1] × [-1, 1]`. Degenerate axes get unit scale.
    pub fn normalizing(frame: &Frame) -> Self {
        let sx = if frame.width() > 0.0 { 2.0 / frame.width() } else { 1.0 };
        let sy = if frame.height() > 0.0 { 2.0 / frame.height() } else { 1.0 };
        let c = frame.center();
        Self::new(-c.x * sx, -c.y * sy, sx, 0.0, 0.0, sy)
    }

    pub fn apply(&self, p: &Point) -> Point {
        Point::new(
            self.dx + self.a11 * p.x + self.a12 * p.y,
            self.dy + self.a21 * p.x + self.a22 * p.y,
        )
    }

    pub fn matrix(&self) -> Matrix2<f64> {
        Matrix2::new(self.a11, self.a12, self.a21, self.a22)
    }

    /// `self ∘ inner`.
    pub fn compose(&self, inner: &LinearTransform) -> LinearTransform {
        let m = self.matrix() * inner.matrix();
        let t = self.apply(&Point::new(inner.dx, inner.dy));
        LinearTransform::new(t.x, t.y, m[(0, 0)], m[(0, 1)], m[(1, 0)], m[(1, 1)])
    }

    pub fn inverted(&self) -> Result<LinearTransform> {
        let inv = self
            .matrix()
            .try_inverse()
            .ok_or(JointcalError::SingularTransform)?;
        let t = inv * nalgebra::Vector2::new(self.dx, self.dy);
        Ok(LinearTransform::new(
            -t.x,
            -t.y,
            inv[(0, 0)],
            inv[(0, 1)],
            inv[(1, 0)],
            inv[(1, 1)],
        ))
    }

    fn params(&self) -> [f64; 6] {
        [self.dx, self.a11, self.a12, self.dy, self.a21, self.a22]
    }

    fn offset(&mut self, delta: &[f64]) {
        self.dx += delta[0];
        self.a11 += delta[1];
        self.a12 += delta[2];
        self.dy += delta[3];
        self.a21 += delta[4];
        self.a22 += delta[5];
    }
}

/// 2D coordinate transform with a flat parameter vector.
#[derive(Debug, Clone, PartialEq)]
pub enum AstrometryTransform {
    Identity,
    Shift { dx: f64, dy: f64 },
    Linear(LinearTransform),
    Polynomial(AstrometryPolynomial),
}

impl AstrometryTransform {
    pub fn apply(&self, p: &Point) -> Point {
        match self {
            AstrometryTransform::Identity => *p,
            AstrometryTransform::Shift { dx, dy } => Point::new(p.x + dx, p.y + dy),
            AstrometryTransform::Linear(lin) => lin.apply(p),
            AstrometryTransform::Polynomial(poly) => poly.apply(p),
        }
    }

    pub fn n_params(&self) -> usize {
        match self {
            AstrometryTransform::Identity => 0,
            AstrometryTransform::Shift { .. } => 2,
            AstrometryTransform::Linear(_) => 6,
            AstrometryTransform::Polynomial(poly) => poly.n_params(),
        }
    }

    pub fn parameters(&self) -> Vec<f64> {
        match self {
            AstrometryTransform::Identity => Vec::new(),
            AstrometryTransform::Shift { dx, dy } => vec![*dx, *dy],
            AstrometryTransform::Linear(lin) => lin.params().to_vec(),
            AstrometryTransform::Polynomial(poly) => poly.coefficients().to_vec(),
        }
    }

    /// Add `delta` (length [`n_params`](Self::n_params)) to the parameters.
    pub fn offset_params(&mut self, delta: &[f64]) {
        assert_eq!(delta.len(), self.n_params(), "delta length mismatch");
        match self {
            AstrometryTransform::Identity => {}
            AstrometryTransform::Shift { dx, dy } => {
                *dx += delta[0];
                *dy += delta[1];
            }
            AstrometryTransform::Linear(lin) => lin.offset(delta),
            AstrometryTransform::Polynomial(poly) => poly.offset_params(delta),
        }
    }

    /// Jacobian `∂(x', y') / ∂(x, y)` at `p`.
    pub fn derivative(&self, p: &Point) -> Matrix2<f64> {
        match self {
            AstrometryTransform::Identity | AstrometryTransform::Shift { .. } => {
                Matrix2::identity()
            }
            AstrometryTransform::Linear(lin) => lin.matrix(),
            AstrometryTransform::Polynomial(poly) => poly.derivative(p),
        }
    }

    /// Fill the `n_params × 2` block of output derivatives w.r.t. parameters.
    pub fn parameter_derivatives(&self, p: &Point, out: &mut DMatrix<f64>) {
        match self {
            AstrometryTransform::Identity => {}
            AstrometryTransform::Shift { .. } => {
                out[(0, 0)] = 1.0;
                out[(0, 1)] = 0.0;
                out[(1, 0)] = 0.0;
                out[(1, 1)] = 1.0;
            }
            AstrometryTransform::Linear(_) => {
                let monos = [1.0, p.x, p.y];
                for (k, m) in monos.iter().enumerate() {
                    out[(k, 0)] = *m;
                    out[(k, 1)] = 0.0;
                    out[(3 + k, 0)] = 0.0;
                    out[(3 + k, 1)] = *m;
                }
            }
            AstrometryTransform::Polynomial(poly) => poly.parameter_derivatives(p, out),
        }
    }

    /// Linear part, if this transform has no higher-order terms.
    pub fn as_linear(&self) -> Option<LinearTransform> {
        match self {
            AstrometryTransform::Identity => Some(LinearTransform::identity()),
            AstrometryTransform::Shift { dx, dy } => {
                Some(LinearTransform::new(*dx, *dy, 1.0, 0.0, 0.0, 1.0))
            }
            AstrometryTransform::Linear(lin) => Some(*lin),
            AstrometryTransform::Polynomial(poly) if poly.order() <= 1 => {
                let order1 = if poly.order() == 1 {
                    poly.clone()
                } else {
                    poly.compose(&AstrometryPolynomial::identity(1))
                };
                Some(LinearTransform::new(
                    order1.x_coeff(0, 0),
                    order1.y_coeff(0, 0),
                    order1.x_coeff(1, 0),
                    order1.x_coeff(0, 1),
                    order1.y_coeff(1, 0),
                    order1.y_coeff(0, 1),
                ))
            }
            AstrometryTransform::Polynomial(_) => None,
        }
    }

    /// Equivalent polynomial (order 1 for the non-polynomial variants).
    pub fn to_polynomial(&self) -> AstrometryPolynomial {
        match self {
            AstrometryTransform::Polynomial(poly) => poly.clone(),
            other => match other.as_linear() {
                Some(lin) => AstrometryPolynomial::from_linear(&lin),
                None => AstrometryPolynomial::identity(1),
            },
        }
    }

    /// `self ∘ inner`, folded into a single variant.
    pub fn compose(&self, inner: &AstrometryTransform) -> AstrometryTransform {
        use AstrometryTransform::*;
        match (self, inner) {
            (Identity, t) | (t, Identity) => t.clone(),
            (Shift { dx: a, dy: b }, Shift { dx: c, dy: d }) => Shift {
                dx: a + c,
                dy: b + d,
            },
            (Shift { .. } | Linear(_), Shift { .. } | Linear(_)) => {
                match (self.as_linear(), inner.as_linear()) {
                    (Some(outer), Some(inner)) => Linear(outer.compose(&inner)),
                    _ => Polynomial(self.to_polynomial().compose(&inner.to_polynomial())),
                }
            }
            _ => Polynomial(self.to_polynomial().compose(&inner.to_polynomial())),
        }
    }

    /// Inverse transform.
    ///
    /// Exact for the affine variants. Higher-order polynomials are inverted
    /// approximately by fitting a polynomial of the same order to points
    /// sampled over `domain` (expressed in this transform's input space).
    pub fn inverted(&self, domain: &Frame) -> Result<AstrometryTransform> {
        match self {
            AstrometryTransform::Identity => Ok(AstrometryTransform::Identity),
            AstrometryTransform::Shift { dx, dy } => Ok(AstrometryTransform::Shift {
                dx: -dx,
                dy: -dy,
            }),
            AstrometryTransform::Linear(lin) => Ok(AstrometryTransform::Linear(lin.inverted()?)),
            AstrometryTransform::Polynomial(poly) => {
                if let Some(lin) = self.as_linear() {
                    return Ok(AstrometryTransform::Linear(lin.inverted()?));
                }
                let n = 4 * poly.order() as usize + 4;
                let pairs: Vec<(Point, Point)> = domain
                    .grid(n)
                    .into_iter()
                    .map(|p| (poly.apply(&p), p))
                    .collect();
                Ok(AstrometryTransform::Polynomial(AstrometryPolynomial::fit(
                    &pairs,
                    poly.order(),
                )?))
            }
        }
    }
}

impl Default for AstrometryTransform {
    fn default() -> Self {
        AstrometryTransform::Identity
    }
}
