//! 2D polynomial coordinate transforms.
//!
//! Each output coordinate is a full bivariate polynomial of the input:
//!
//! ```text
//! x' = Σ A_pq · x^p · y^q     (0 ≤ p+q ≤ order)
//! y' = Σ B_pq · x^p · y^q
//! ```
//!
//! Coefficients are stored flat, all `A` terms first and then all `B` terms,
//! each block enumerated by increasing total degree and, within a degree, by
//! decreasing power of x:
//!
//! ```text
//! (0,0), (1,0), (0,1), (2,0), (1,1), (0,2), (3,0), ...
//! ```
//!
//! The flat coefficient vector doubles as the parameter vector seen by the
//! fitter, so its layout is also the layout of the parameter derivatives.

use nalgebra::{DMatrix, DVector, Matrix2};

use crate::error::{JointcalError, Result};
use crate::geom::{Frame, Point};

use super::LinearTransform;

/// Polynomial transform with independent x and y output polynomials.
#[derive(Debug, Clone, PartialEq)]
pub struct AstrometryPolynomial {
    order: u32,
    coeffs: Vec<f64>,
}

impl AstrometryPolynomial {
    /// Build from a flat coefficient vector of length `2 * num_terms(order)`.
    pub fn from_coefficients(order: u32, coeffs: Vec<f64>) -> Self {
        assert_eq!(
            coeffs.len(),
            2 * num_terms(order),
            "coefficient length mismatch"
        );
        Self { order, coeffs }
    }

    /// All-zero polynomial of the given order.
    pub fn zero(order: u32) -> Self {
        Self {
            order,
            coeffs: vec![0.0; 2 * num_terms(order)],
        }
    }

    /// Identity map expressed at the given order (must be ≥ 1).
    pub fn identity(order: u32) -> Self {
        assert!(order >= 1, "an identity polynomial needs order >= 1");
        let mut poly = Self::zero(order);
        poly.set_x_coeff(1, 0, 1.0);
        poly.set_y_coeff(0, 1, 1.0);
        poly
    }

    /// Order-1 polynomial equal to a linear transform.
    pub fn from_linear(lin: &LinearTransform) -> Self {
        let mut poly = Self::zero(1);
        poly.set_x_coeff(0, 0, lin.dx);
        poly.set_x_coeff(1, 0, lin.a11);
        poly.set_x_coeff(0, 1, lin.a12);
        poly.set_y_coeff(0, 0, lin.dy);
        poly.set_y_coeff(1, 0, lin.a21);
        poly.set_y_coeff(0, 1, lin.a22);
        poly
    }

    pub fn order(&self) -> u32 {
        self.order
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coeffs
    }

    /// Coefficient of `x^p y^q` in the x output.
    pub fn x_coeff(&self, p: u32, q: u32) -> f64 {
        self.coeffs[term_index(p, q)]
    }

    /// Coefficient of `x^p y^q` in the y output.
    pub fn y_coeff(&self, p: u32, q: u32) -> f64 {
        self.coeffs[num_terms(self.order) + term_index(p, q)]
    }

    pub fn set_x_coeff(&mut self, p: u32, q: u32, value: f64) {
        assert!(p + q <= self.order, "term beyond polynomial order");
        self.coeffs[term_index(p, q)] = value;
    }

    pub fn set_y_coeff(&mut self, p: u32, q: u32, value: f64) {
        assert!(p + q <= self.order, "term beyond polynomial order");
        let n = num_terms(self.order);
        self.coeffs[n + term_index(p, q)] = value;
    }

    /// Number of free parameters (both output polynomials).
    pub fn n_params(&self) -> usize {
        self.coeffs.len()
    }

    pub fn offset_params(&mut self, delta: &[f64]) {
        assert_eq!(delta.len(), self.coeffs.len(), "delta length mismatch");
        for (c, d) in self.coeffs.iter_mut().zip(delta) {
            *c += d;
        }
    }

    pub fn apply(&self, p: &Point) -> Point {
        let n = num_terms(self.order);
        let mut monos = vec![0.0; n];
        monomials(self.order, p.x, p.y, &mut monos);
        let x = dot(&self.coeffs[..n], &monos);
        let y = dot(&self.coeffs[n..], &monos);
        Point::new(x, y)
    }

    /// Jacobian `∂(x', y') / ∂(x, y)` at `p`.
    pub fn derivative(&self, p: &Point) -> Matrix2<f64> {
        let n = num_terms(self.order);
        let mut dxx = 0.0;
        let mut dxy = 0.0;
        let mut dyx = 0.0;
        let mut dyy = 0.0;
        for (k, (pw, qw)) in term_pairs(self.order).into_iter().enumerate() {
            let a = self.coeffs[k];
            let b = self.coeffs[n + k];
            if pw > 0 {
                let d = pw as f64 * powi(p.x, pw - 1) * powi(p.y, qw);
                dxx += a * d;
                dyx += b * d;
            }
            if qw > 0 {
                let d = qw as f64 * powi(p.x, pw) * powi(p.y, qw - 1);
                dxy += a * d;
                dyy += b * d;
            }
        }
        Matrix2::new(dxx, dxy, dyx, dyy)
    }

    /// Derivatives of the output with respect to every coefficient.
    ///
    /// Writes an `n_params × 2` block: row `k` holds `(∂x'/∂c_k, ∂y'/∂c_k)`.
    pub fn parameter_derivatives(&self, p: &Point, out: &mut DMatrix<f64>) {
        let n = num_terms(self.order);
        let mut monos = vec![0.0; n];
        monomials(self.order, p.x, p.y, &mut monos);
        for (k, m) in monos.iter().enumerate() {
            out[(k, 0)] = *m;
            out[(k, 1)] = 0.0;
            out[(n + k, 0)] = 0.0;
            out[(n + k, 1)] = *m;
        }
    }

    /// Exact composition `self ∘ inner`, of order `self.order * inner.order`.
    pub fn compose(&self, inner: &AstrometryPolynomial) -> AstrometryPolynomial {
        let order = (self.order * inner.order).max(1);
        let deg = order as usize;
        let u = Dense::from_block(inner, 0, deg);
        let v = Dense::from_block(inner, 1, deg);

        let mut u_pows = vec![Dense::one(deg)];
        let mut v_pows = vec![Dense::one(deg)];
        for _ in 0..self.order {
            let next_u = u_pows[u_pows.len() - 1].mul(&u);
            u_pows.push(next_u);
            let next_v = v_pows[v_pows.len() - 1].mul(&v);
            v_pows.push(next_v);
        }

        let n_self = num_terms(self.order);
        let mut x_out = Dense::zero(deg);
        let mut y_out = Dense::zero(deg);
        for (k, (p, q)) in term_pairs(self.order).into_iter().enumerate() {
            let a = self.coeffs[k];
            let b = self.coeffs[n_self + k];
            if a == 0.0 && b == 0.0 {
                continue;
            }
            let term = u_pows[p as usize].mul(&v_pows[q as usize]);
            x_out.add_scaled(&term, a);
            y_out.add_scaled(&term, b);
        }

        let n = num_terms(order);
        let mut coeffs = vec![0.0; 2 * n];
        for (k, (p, q)) in term_pairs(order).into_iter().enumerate() {
            coeffs[k] = x_out.get(p as usize, q as usize);
            coeffs[n + k] = y_out.get(p as usize, q as usize);
        }
        AstrometryPolynomial { order, coeffs }
    }

    /// Least-squares fit of a polynomial mapping `pairs[i].0 → pairs[i].1`.
    ///
    /// Inputs are normalized to `[-1, 1]` over their bounding frame before the
    /// SVD solve and the normalization is folded back into the result.
    pub fn fit(pairs: &[(Point, Point)], order: u32) -> Result<AstrometryPolynomial> {
        let n = num_terms(order);
        if pairs.len() < n {
            return Err(JointcalError::PolynomialFit(format!(
                "{} points cannot constrain {} terms",
                pairs.len(),
                n
            )));
        }
        let inputs: Vec<Point> = pairs.iter().map(|(p, _)| *p).collect();
        let frame = Frame::around(&inputs)
            .ok_or_else(|| JointcalError::PolynomialFit("no points".into()))?;
        let normalizer = LinearTransform::normalizing(&frame);

        let mut a_mat = DMatrix::<f64>::zeros(pairs.len(), n);
        let mut bx = DVector::<f64>::zeros(pairs.len());
        let mut by = DVector::<f64>::zeros(pairs.len());
        let mut monos = vec![0.0; n];
        for (row, (input, output)) in pairs.iter().enumerate() {
            let u = normalizer.apply(input);
            monomials(order, u.x, u.y, &mut monos);
            for (col, m) in monos.iter().enumerate() {
                a_mat[(row, col)] = *m;
            }
            bx[row] = output.x;
            by[row] = output.y;
        }

        let svd = a_mat.svd(true, true);
        let cx = svd
            .solve(&bx, 1e-14)
            .map_err(|e| JointcalError::PolynomialFit(e.to_string()))?;
        let cy = svd
            .solve(&by, 1e-14)
            .map_err(|e| JointcalError::PolynomialFit(e.to_string()))?;

        let mut coeffs: Vec<f64> = Vec::with_capacity(2 * n);
        coeffs.extend(cx.iter().copied());
        coeffs.extend(cy.iter().copied());
        if coeffs.iter().any(|c| !c.is_finite()) {
            return Err(JointcalError::PolynomialFit(
                "non-finite coefficients".into(),
            ));
        }
        let normalized = AstrometryPolynomial { order, coeffs };
        Ok(normalized.compose(&AstrometryPolynomial::from_linear(&normalizer)))
    }
}

// ── Polynomial term helpers ─────────────────────────────────────────────────

/// Number of monomials `x^p y^q` with `p+q ≤ order`.
pub fn num_terms(order: u32) -> usize {
    let o = order as usize;
    (o + 1) * (o + 2) / 2
}

/// Flat index of `x^p y^q` within one output block.
pub fn term_index(p: u32, q: u32) -> usize {
    let s = (p + q) as usize;
    s * (s + 1) / 2 + (s - p as usize)
}

/// Enumerate all `(p, q)` pairs for the given order, in storage order.
pub fn term_pairs(order: u32) -> Vec<(u32, u32)> {
    let mut pairs = Vec::with_capacity(num_terms(order));
    for s in 0..=order {
        for p in (0..=s).rev() {
            pairs.push((p, s - p));
        }
    }
    pairs
}

/// Fill `out` with the monomial values at `(x, y)`, in storage order.
pub(crate) fn monomials(order: u32, x: f64, y: f64, out: &mut [f64]) {
    let mut idx = 0;
    for s in 0..=order {
        for p in (0..=s).rev() {
            out[idx] = powi(x, p) * powi(y, s - p);
            idx += 1;
        }
    }
}

fn powi(v: f64, e: u32) -> f64 {
    v.powi(e as i32)
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Dense bivariate polynomial used for exact composition: `c[p][q]` is the
/// coefficient of `x^p y^q`, with `p, q ≤ deg`.
struct Dense {
    deg: usize,
    c: Vec<f64>,
}

impl Dense {
    fn zero(deg: usize) -> Self {
        Self {
            deg,
            c: vec![0.0; (deg + 1) * (deg + 1)],
        }
    }

    fn one(deg: usize) -> Self {
        let mut d = Self::zero(deg);
        d.c[0] = 1.0;
        d
    }

    fn from_block(poly: &AstrometryPolynomial, block: usize, deg: usize) -> Self {
        let n = num_terms(poly.order);
        let mut d = Self::zero(deg);
        for (k, (p, q)) in term_pairs(poly.order).into_iter().enumerate() {
            let (p, q) = (p as usize, q as usize);
            if p <= deg && q <= deg {
                d.c[p * (deg + 1) + q] = poly.coeffs[block * n + k];
            }
        }
        d
    }

    fn get(&self, p: usize, q: usize) -> f64 {
        self.c[p * (self.deg + 1) + q]
    }

    /// Product truncated to total degree `deg`; exact whenever the true
    /// product's degree does not exceed it.
    fn mul(&self, other: &Dense) -> Dense {
        let deg = self.deg;
        let mut out = Dense::zero(deg);
        for p1 in 0..=deg {
            for q1 in 0..=(deg - p1) {
                let a = self.get(p1, q1);
                if a == 0.0 {
                    continue;
                }
                for p2 in 0..=(deg - p1) {
                    for q2 in 0..=(deg - p1 - p2).saturating_sub(q1) {
                        if p1 + p2 + q1 + q2 > deg {
                            continue;
                        }
                        let b = other.get(p2, q2);
                        if b != 0.0 {
                            out.c[(p1 + p2) * (deg + 1) + q1 + q2] += a * b;
                        }
                    }
                }
            }
        }
        out
    }

    fn add_scaled(&mut self, other: &Dense, scale: f64) {
        for (a, b) in self.c.iter_mut().zip(&other.c) {
            *a += scale * b;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_poly() -> AstrometryPolynomial {
        let mut poly = AstrometryPolynomial::identity(3);
        poly.set_x_coeff(0, 0, 0.5);
        poly.set_x_coeff(2, 0, 1e-3);
        poly.set_x_coeff(1, 2, -2e-4);
        poly.set_y_coeff(0, 0, -1.5);
        poly.set_y_coeff(1, 1, 3e-3);
        poly.set_y_coeff(0, 3, 1e-4);
        poly
    }

    #[test]
    fn test_num_terms() {
        assert_eq!(num_terms(0), 1);
        assert_eq!(num_terms(1), 3);
        assert_eq!(num_terms(2), 6);
        assert_eq!(num_terms(3), 10);
    }

    #[test]
    fn test_term_index_matches_pairs() {
        for (k, (p, q)) in term_pairs(5).into_iter().enumerate() {
            assert_eq!(term_index(p, q), k);
        }
        assert_eq!(
            term_pairs(2),
            vec![(0, 0), (1, 0), (0, 1), (2, 0), (1, 1), (0, 2)]
        );
    }

    #[test]
    fn test_identity_apply() {
        let poly = AstrometryPolynomial::identity(2);
        let p = poly.apply(&Point::new(3.0, -4.0));
        assert_eq!(p, Point::new(3.0, -4.0));
    }

    #[test]
    fn test_compose_matches_sequential_application() {
        let outer = sample_poly();
        let mut inner = AstrometryPolynomial::identity(2);
        inner.set_x_coeff(0, 0, 0.1);
        inner.set_x_coeff(0, 1, 0.2);
        inner.set_y_coeff(2, 0, -0.05);

        let composed = outer.compose(&inner);
        assert_eq!(composed.order(), 6);
        for p in [Point::new(0.3, -0.7), Point::new(1.2, 0.4), Point::new(-2.0, 1.5)] {
            let expected = outer.apply(&inner.apply(&p));
            let got = composed.apply(&p);
            assert!((expected.x - got.x).abs() < 1e-12);
            assert!((expected.y - got.y).abs() < 1e-12);
        }
    }

    #[test]
    fn test_compose_with_linear_keeps_order() {
        let outer = sample_poly();
        let lin = LinearTransform::new(10.0, -3.0, 0.5, 0.1, -0.2, 0.7);
        let composed = outer.compose(&AstrometryPolynomial::from_linear(&lin));
        assert_eq!(composed.order(), 3);
        let p = Point::new(2.0, 5.0);
        let expected = outer.apply(&lin.apply(&p));
        let got = composed.apply(&p);
        assert!((expected.x - got.x).abs() < 1e-10);
        assert!((expected.y - got.y).abs() < 1e-10);
    }

    #[test]
    fn test_derivative_matches_finite_difference() {
        let poly = sample_poly();
        let p = Point::new(1.3, -0.8);
        let jac = poly.derivative(&p);
        let h = 1e-6;
        let f0 = poly.apply(&p);
        let fx = poly.apply(&Point::new(p.x + h, p.y));
        let fy = poly.apply(&Point::new(p.x, p.y + h));
        assert!((jac[(0, 0)] - (fx.x - f0.x) / h).abs() < 1e-5);
        assert!((jac[(1, 0)] - (fx.y - f0.y) / h).abs() < 1e-5);
        assert!((jac[(0, 1)] - (fy.x - f0.x) / h).abs() < 1e-5);
        assert!((jac[(1, 1)] - (fy.y - f0.y) / h).abs() < 1e-5);
    }

    #[test]
    fn test_parameter_derivatives_are_monomials() {
        let poly = sample_poly();
        let mut out = DMatrix::zeros(poly.n_params(), 2);
        poly.parameter_derivatives(&Point::new(2.0, 3.0), &mut out);
        let n = num_terms(3);
        // x^1 y^2 term
        let k = term_index(1, 2);
        assert_eq!(out[(k, 0)], 18.0);
        assert_eq!(out[(k, 1)], 0.0);
        assert_eq!(out[(n + k, 1)], 18.0);
    }

    #[test]
    fn test_fit_recovers_polynomial() {
        let truth = sample_poly();
        let frame = Frame::new(-50.0, -20.0, 80.0, 60.0);
        let pairs: Vec<(Point, Point)> = frame
            .grid(8)
            .into_iter()
            .map(|p| (p, truth.apply(&p)))
            .collect();
        let fitted = AstrometryPolynomial::fit(&pairs, 3).unwrap();
        for (input, output) in &pairs {
            let got = fitted.apply(input);
            assert!((got.x - output.x).abs() < 1e-7);
            assert!((got.y - output.y).abs() < 1e-7);
        }
    }

    #[test]
    fn test_fit_rejects_underdetermined() {
        let pairs = vec![(Point::new(0.0, 0.0), Point::new(1.0, 1.0))];
        assert!(AstrometryPolynomial::fit(&pairs, 1).is_err());
    }
}
