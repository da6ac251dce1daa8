//! Photometric transforms: instrumental flux or magnitude → calibrated value.
//!
//! Flux transforms are multiplicative (`flux = factor(x, y) · instFlux`) and
//! scale the error with the value. Magnitude transforms are additive
//! (`mag = instMag + offset(x, y)`) and leave the error unchanged.
//!
//! The spatially varying variants evaluate a bivariate polynomial over
//! coordinates normalized to `[-1, 1]` across a reference frame (a CCD
//! bounding box or the focal plane), which keeps the coefficients of
//! comparable size whatever the pixel scale.

use crate::geom::{Frame, Point};

use super::polynomial::{monomials, num_terms};
use super::LinearTransform;

/// Bivariate polynomial `Σ c_k · u^p · v^q` over a normalized frame.
#[derive(Debug, Clone, PartialEq)]
pub struct PhotometryPolynomial {
    order: u32,
    frame: Frame,
    normalizer: LinearTransform,
    coeffs: Vec<f64>,
}

impl PhotometryPolynomial {
    /// Polynomial equal to the constant `value` everywhere.
    pub fn constant(order: u32, frame: Frame, value: f64) -> Self {
        let mut coeffs = vec![0.0; num_terms(order)];
        coeffs[0] = value;
        Self {
            order,
            frame,
            normalizer: LinearTransform::normalizing(&frame),
            coeffs,
        }
    }

    pub fn order(&self) -> u32 {
        self.order
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coeffs
    }

    pub fn evaluate(&self, x: f64, y: f64) -> f64 {
        let mut terms = vec![0.0; self.coeffs.len()];
        self.terms(x, y, &mut terms);
        terms.iter().zip(&self.coeffs).map(|(t, c)| t * c).sum()
    }

    fn terms(&self, x: f64, y: f64, out: &mut [f64]) {
        let u = self.normalizer.apply(&Point::new(x, y));
        monomials(self.order, u.x, u.y, out);
    }
}

/// Instrumental → calibrated value transform.
#[derive(Debug, Clone, PartialEq)]
pub enum PhotometryTransform {
    /// `flux = scale · instFlux`
    FluxScale(f64),
    /// `mag = instMag + offset`
    MagnitudeOffset(f64),
    /// `flux = P(x, y) · instFlux`
    FluxPolynomial(PhotometryPolynomial),
    /// `mag = instMag + P(x, y)`
    MagnitudePolynomial(PhotometryPolynomial),
}

impl PhotometryTransform {
    /// True for the multiplicative (flux) variants.
    pub fn is_flux(&self) -> bool {
        matches!(
            self,
            PhotometryTransform::FluxScale(_) | PhotometryTransform::FluxPolynomial(_)
        )
    }

    pub fn n_params(&self) -> usize {
        match self {
            PhotometryTransform::FluxScale(_) | PhotometryTransform::MagnitudeOffset(_) => 1,
            PhotometryTransform::FluxPolynomial(p) | PhotometryTransform::MagnitudePolynomial(p) => {
                p.coeffs.len()
            }
        }
    }

    pub fn parameters(&self) -> Vec<f64> {
        match self {
            PhotometryTransform::FluxScale(v) | PhotometryTransform::MagnitudeOffset(v) => vec![*v],
            PhotometryTransform::FluxPolynomial(p) | PhotometryTransform::MagnitudePolynomial(p) => {
                p.coeffs.clone()
            }
        }
    }

    pub fn offset_params(&mut self, delta: &[f64]) {
        assert_eq!(delta.len(), self.n_params(), "delta length mismatch");
        match self {
            PhotometryTransform::FluxScale(v) | PhotometryTransform::MagnitudeOffset(v) => {
                *v += delta[0]
            }
            PhotometryTransform::FluxPolynomial(p) | PhotometryTransform::MagnitudePolynomial(p) => {
                for (c, d) in p.coeffs.iter_mut().zip(delta) {
                    *c += d;
                }
            }
        }
    }

    /// Multiplicative factor (flux) or additive offset (magnitude) at `(x, y)`.
    pub fn factor(&self, x: f64, y: f64) -> f64 {
        match self {
            PhotometryTransform::FluxScale(v) | PhotometryTransform::MagnitudeOffset(v) => *v,
            PhotometryTransform::FluxPolynomial(p) | PhotometryTransform::MagnitudePolynomial(p) => {
                p.evaluate(x, y)
            }
        }
    }

    pub fn transform(&self, x: f64, y: f64, value: f64) -> f64 {
        if self.is_flux() {
            self.factor(x, y) * value
        } else {
            value + self.factor(x, y)
        }
    }

    pub fn transform_error(&self, x: f64, y: f64, _value: f64, value_err: f64) -> f64 {
        if self.is_flux() {
            self.factor(x, y).abs() * value_err
        } else {
            value_err
        }
    }

    /// Derivatives of `transform(x, y, value)` w.r.t. each parameter.
    pub fn parameter_derivatives(&self, x: f64, y: f64, value: f64, out: &mut [f64]) {
        match self {
            PhotometryTransform::FluxScale(_) => out[0] = value,
            PhotometryTransform::MagnitudeOffset(_) => out[0] = 1.0,
            PhotometryTransform::FluxPolynomial(p) => {
                p.terms(x, y, out);
                for d in out.iter_mut().take(p.coeffs.len()) {
                    *d *= value;
                }
            }
            PhotometryTransform::MagnitudePolynomial(p) => p.terms(x, y, out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> Frame {
        Frame::new(0.0, 0.0, 1000.0, 2000.0)
    }

    #[test]
    fn test_flux_scale() {
        let t = PhotometryTransform::FluxScale(2.5);
        assert_eq!(t.transform(1.0, 2.0, 100.0), 250.0);
        assert_eq!(t.transform_error(1.0, 2.0, 100.0, 4.0), 10.0);
        let mut d = [0.0];
        t.parameter_derivatives(1.0, 2.0, 100.0, &mut d);
        assert_eq!(d[0], 100.0);
    }

    #[test]
    fn test_magnitude_offset_keeps_error() {
        let t = PhotometryTransform::MagnitudeOffset(25.0);
        assert_eq!(t.transform(0.0, 0.0, -10.0), 15.0);
        assert_eq!(t.transform_error(0.0, 0.0, -10.0, 0.02), 0.02);
        assert!(!t.is_flux());
    }

    #[test]
    fn test_constant_polynomial_matches_scale() {
        let t = PhotometryTransform::FluxPolynomial(PhotometryPolynomial::constant(2, frame(), 3.0));
        assert_eq!(t.n_params(), 6);
        assert!((t.transform(123.0, 1456.0, 10.0) - 30.0).abs() < 1e-12);
    }

    #[test]
    fn test_polynomial_derivatives_match_finite_difference() {
        let mut t =
            PhotometryTransform::FluxPolynomial(PhotometryPolynomial::constant(2, frame(), 1.0));
        t.offset_params(&[0.0, 0.1, -0.05, 0.02, 0.01, -0.03]);
        let (x, y, value) = (700.0, 300.0, 50.0);
        let mut d = vec![0.0; t.n_params()];
        t.parameter_derivatives(x, y, value, &mut d);
        let base = t.transform(x, y, value);
        let h = 1e-6;
        for k in 0..t.n_params() {
            let mut delta = vec![0.0; t.n_params()];
            delta[k] = h;
            let mut shifted = t.clone();
            shifted.offset_params(&delta);
            let numeric = (shifted.transform(x, y, value) - base) / h;
            assert!((numeric - d[k]).abs() < 1e-5, "param {k}: {numeric} vs {}", d[k]);
        }
    }

    #[test]
    fn test_magnitude_polynomial_is_additive() {
        let mut t = PhotometryTransform::MagnitudePolynomial(PhotometryPolynomial::constant(
            1,
            frame(),
            0.5,
        ));
        t.offset_params(&[0.0, 0.1, 0.0]);
        // Right edge of the frame normalizes to u = 1
        assert!((t.transform(1000.0, 1000.0, 20.0) - 20.6).abs() < 1e-12);
        let mut d = vec![0.0; 3];
        t.parameter_derivatives(1000.0, 1000.0, 20.0, &mut d);
        assert!((d[0] - 1.0).abs() < 1e-12);
        assert!((d[1] - 1.0).abs() < 1e-12);
        assert!(d[2].abs() < 1e-12);
    }
}
