//! Conversion of TAN-SIP world coordinate descriptions into transforms.
//!
//! A TAN-SIP WCS maps pixels to the sky in three steps:
//!
//! ```text
//! (u, v)   = (x - crpix_x, y - crpix_y)
//! (u', v') = (u + Σ A_pq u^p v^q, v + Σ B_pq u^p v^q)     (2 ≤ p+q)
//! (ξ, η)   = CD · (u', v')                                 (degrees)
//! ```
//!
//! followed by the inverse gnomonic projection about `crval`. The first three
//! steps fold into one [`AstrometryPolynomial`] of the SIP order, which is the
//! form every other part of the crate consumes.

use nalgebra::Matrix2;

use crate::error::{JointcalError, Result};
use crate::geom::{tan_deproject, tan_project, Frame, Point, SkyPoint};

use super::{AstrometryPolynomial, AstrometryTransform, LinearTransform};

/// External TAN or TAN-SIP description of a pixel → sky mapping.
///
/// `crpix` uses the same pixel origin as the detections it will be applied to.
#[derive(Debug, Clone, PartialEq)]
pub struct SipWcs {
    pub crpix: Point,
    pub crval: SkyPoint,
    /// Degrees per pixel.
    pub cd: Matrix2<f64>,
    /// Forward `A_pq` distortion terms as `(p, q, value)`.
    pub a: Vec<(u32, u32, f64)>,
    /// Forward `B_pq` distortion terms as `(p, q, value)`.
    pub b: Vec<(u32, u32, f64)>,
}

impl SipWcs {
    /// Pure TAN description without distortion terms.
    pub fn tan(crpix: Point, crval: SkyPoint, cd: Matrix2<f64>) -> Self {
        Self {
            crpix,
            crval,
            cd,
            a: Vec::new(),
            b: Vec::new(),
        }
    }

    /// Highest total degree among the distortion terms (1 without SIP).
    pub fn sip_order(&self) -> u32 {
        self.a
            .iter()
            .chain(&self.b)
            .map(|(p, q, _)| p + q)
            .max()
            .unwrap_or(1)
            .max(1)
    }

    /// Fold the description into a tangent point plus one pixel → tangent
    /// plane transform.
    pub fn to_sky_wcs(&self) -> SkyWcs {
        let shift = AstrometryTransform::Shift {
            dx: -self.crpix.x,
            dy: -self.crpix.y,
        };
        let cd = AstrometryTransform::Linear(LinearTransform::new(
            0.0,
            0.0,
            self.cd[(0, 0)],
            self.cd[(0, 1)],
            self.cd[(1, 0)],
            self.cd[(1, 1)],
        ));

        let corrected = if self.a.is_empty() && self.b.is_empty() {
            shift
        } else {
            let mut sip = AstrometryPolynomial::identity(self.sip_order());
            for &(p, q, value) in &self.a {
                sip.set_x_coeff(p, q, sip.x_coeff(p, q) + value);
            }
            for &(p, q, value) in &self.b {
                sip.set_y_coeff(p, q, sip.y_coeff(p, q) + value);
            }
            AstrometryTransform::Polynomial(sip).compose(&shift)
        };

        SkyWcs::new(self.crval, cd.compose(&corrected))
    }
}

/// Pixel → sky mapping as a tangent point plus a pixel → tangent-plane
/// transform (tangent-plane coordinates in degrees).
#[derive(Debug, Clone, PartialEq)]
pub struct SkyWcs {
    tangent_point: SkyPoint,
    pixel_to_tangent_plane: AstrometryTransform,
}

impl SkyWcs {
    pub fn new(tangent_point: SkyPoint, pixel_to_tangent_plane: AstrometryTransform) -> Self {
        Self {
            tangent_point,
            pixel_to_tangent_plane,
        }
    }

    pub fn tangent_point(&self) -> &SkyPoint {
        &self.tangent_point
    }

    pub fn pixel_to_tangent_plane(&self) -> &AstrometryTransform {
        &self.pixel_to_tangent_plane
    }

    pub fn pixel_to_sky(&self, p: &Point) -> SkyPoint {
        let tp = self.pixel_to_tangent_plane.apply(p);
        tan_deproject(&tp, &self.tangent_point)
    }

    /// Sky → pixel, inverting the pixel transform over `pixel_domain`.
    pub fn sky_to_pixel(&self, sky: &SkyPoint, pixel_domain: &Frame) -> Result<Point> {
        let tp = tan_project(sky, &self.tangent_point).ok_or(JointcalError::Projection {
            ra: sky.ra,
            dec: sky.dec,
        })?;
        let inverse = self.pixel_to_tangent_plane.inverted(pixel_domain)?;
        Ok(inverse.apply(&tp))
    }
}
