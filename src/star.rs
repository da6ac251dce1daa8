//! Star records shared by the association and fit code.
//!
//! - [`MeasuredStar`]: one detection on one CCD image.
//! - [`FittedStar`]: the cross-exposure estimate of one physical star. Fitted
//!   stars live in an arena owned by [`Associations`](crate::Associations) and
//!   are addressed by [`FittedStarId`].
//! - [`RefStar`]: an entry from an external reference catalog.
//!
//! A measured star points at its fitted star through an `Option<FittedStarId>`
//! lookup key; the fitted star only keeps a count of the detections linked to
//! it. Linking and unlinking go through [`link_fitted_star`] and
//! [`unlink_fitted_star`] so the two sides cannot drift apart.

use std::fmt;

use crate::geom::{Point, SkyPoint};

/// AB magnitude zero point for fluxes in nJy.
pub const AB_ZERO_POINT_NJY: f64 = 31.4;

/// 2.5 / ln(10): converts a relative flux error into a magnitude error.
const MAG_ERR_FACTOR: f64 = 1.085_736_204_758_129_6;

/// AB magnitude of a flux in nJy.
pub fn flux_to_magnitude(flux: f64) -> f64 {
    -2.5 * flux.log10() + AB_ZERO_POINT_NJY
}

/// Flux in nJy of an AB magnitude.
pub fn magnitude_to_flux(mag: f64) -> f64 {
    10f64.powf(-0.4 * (mag - AB_ZERO_POINT_NJY))
}

/// Magnitude error corresponding to a flux and its error.
pub fn magnitude_error(flux: f64, flux_err: f64) -> f64 {
    MAG_ERR_FACTOR * flux_err / flux
}

/// Index of a fitted star in the association arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FittedStarId(pub usize);

/// Index of a reference star in the association's reference list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefStarId(pub usize);

/// Address of a detection: the `index`-th entry of the fit catalog of the
/// `ccd`-th image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeasuredStarId {
    pub ccd: usize,
    pub index: usize,
}

impl fmt::Display for MeasuredStarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ccd[{}]#{}", self.ccd, self.index)
    }
}

/// A single detection on one CCD image.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasuredStar {
    /// Source identifier from the input catalog.
    pub id: u64,
    /// Pixel position.
    pub x: f64,
    pub y: f64,
    /// Pixel position covariance (px²).
    pub vx: f64,
    pub vy: f64,
    pub vxy: f64,
    /// Position in the focal plane.
    pub x_focal: f64,
    pub y_focal: f64,
    pub inst_flux: f64,
    pub inst_flux_err: f64,
    /// Calibrated flux (nJy) from the input photometric calibration.
    pub flux: f64,
    pub flux_err: f64,
    pub mag: f64,
    valid: bool,
    fitted_star: Option<FittedStarId>,
}

impl MeasuredStar {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        pixel: Point,
        vx: f64,
        vy: f64,
        vxy: f64,
        focal: Point,
        inst_flux: f64,
        inst_flux_err: f64,
        calibration: f64,
    ) -> Self {
        let flux = inst_flux * calibration;
        Self {
            id,
            x: pixel.x,
            y: pixel.y,
            vx,
            vy,
            vxy,
            x_focal: focal.x,
            y_focal: focal.y,
            inst_flux,
            inst_flux_err,
            flux,
            flux_err: inst_flux_err * calibration,
            mag: flux_to_magnitude(flux),
            valid: true,
            fitted_star: None,
        }
    }

    pub fn pixel(&self) -> Point {
        Point::new(self.x, self.y)
    }

    pub fn focal(&self) -> Point {
        Point::new(self.x_focal, self.y_focal)
    }

    /// Instrumental magnitude, `-2.5 log10(instFlux)`.
    pub fn inst_mag(&self) -> f64 {
        -2.5 * self.inst_flux.log10()
    }

    pub fn inst_mag_err(&self) -> f64 {
        magnitude_error(self.inst_flux, self.inst_flux_err)
    }

    /// False once the detection has been rejected (too few measurements of its
    /// star, or flagged as an outlier).
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn set_valid(&mut self, valid: bool) {
        self.valid = valid;
    }

    pub fn fitted_star(&self) -> Option<FittedStarId> {
        self.fitted_star
    }

    /// Rewrite the link after the fitted-star arena was compacted.
    pub(crate) fn remap_fitted_star(&mut self, remap: &[Option<usize>]) {
        self.fitted_star = self
            .fitted_star
            .and_then(|FittedStarId(old)| remap[old].map(FittedStarId));
    }
}

/// Link `measured` to `id`, moving it off any previous fitted star.
pub fn link_fitted_star(measured: &mut MeasuredStar, fitted: &mut [FittedStar], id: FittedStarId) {
    unlink_fitted_star(measured, fitted);
    fitted[id.0].measurement_count += 1;
    measured.fitted_star = Some(id);
}

/// Drop the link of `measured`, decrementing its fitted star's count.
pub fn unlink_fitted_star(measured: &mut MeasuredStar, fitted: &mut [FittedStar]) {
    if let Some(FittedStarId(old)) = measured.fitted_star.take() {
        let star = &mut fitted[old];
        assert!(
            star.measurement_count > 0,
            "fitted star {old} measurement count underflow"
        );
        star.measurement_count -= 1;
    }
}

/// Cross-exposure estimate of one physical star.
#[derive(Debug, Clone, PartialEq)]
pub struct FittedStar {
    /// Sky position (degrees).
    pub ra: f64,
    pub dec: f64,
    /// Flux (nJy) and the matching AB magnitude.
    pub flux: f64,
    pub mag: f64,
    /// Number of valid detections linked to this star.
    pub measurement_count: usize,
    pub ref_star: Option<RefStarId>,
    /// First of two position parameters (ra, dec) in the current fit.
    pub position_index: Option<usize>,
    /// Flux (or magnitude) parameter in the current fit.
    pub flux_index: Option<usize>,
}

impl FittedStar {
    pub fn new(position: SkyPoint, flux: f64) -> Self {
        Self {
            ra: position.ra,
            dec: position.dec,
            flux,
            mag: flux_to_magnitude(flux),
            measurement_count: 0,
            ref_star: None,
            position_index: None,
            flux_index: None,
        }
    }

    pub fn position(&self) -> SkyPoint {
        SkyPoint::new(self.ra, self.dec)
    }

    pub fn set_position(&mut self, position: SkyPoint) {
        self.ra = position.ra.rem_euclid(360.0);
        self.dec = position.dec;
    }

    pub fn set_flux(&mut self, flux: f64) {
        self.flux = flux;
        self.mag = flux_to_magnitude(flux);
    }

    pub fn set_mag(&mut self, mag: f64) {
        self.mag = mag;
        self.flux = magnitude_to_flux(mag);
    }

    /// Reset counts and reference links before a new association pass.
    pub(crate) fn clear_before_association(&mut self) {
        self.measurement_count = 0;
        self.ref_star = None;
        self.position_index = None;
        self.flux_index = None;
    }
}

/// External reference-catalog entry.
#[derive(Debug, Clone, PartialEq)]
pub struct RefStar {
    pub id: u64,
    /// Position (degrees) at `epoch`.
    pub ra: f64,
    pub dec: f64,
    /// Position errors (degrees). `ra_err` is a coordinate error, i.e. it is
    /// not multiplied by cos(dec).
    pub ra_err: f64,
    pub dec_err: f64,
    pub flux: f64,
    pub flux_err: f64,
    /// Proper motion (mas/yr); `pm_ra` includes the cos(dec) factor.
    pub pm_ra: f64,
    pub pm_dec: f64,
    /// Julian year the position refers to.
    pub epoch: f64,
}

impl RefStar {
    pub fn position(&self) -> SkyPoint {
        SkyPoint::new(self.ra, self.dec)
    }

    pub fn mag(&self) -> f64 {
        flux_to_magnitude(self.flux)
    }

    pub fn mag_err(&self) -> f64 {
        magnitude_error(self.flux, self.flux_err)
    }

    /// Copy of this star with its position moved to `epoch_year`.
    ///
    /// Proper motion near the celestial poles (|dec| > ~87°) is ignored because
    /// the cos(dec) divisor becomes numerically unstable.
    pub fn propagated(&self, epoch_year: f64) -> RefStar {
        const MAS_TO_DEG: f64 = 1.0 / 3_600_000.0;

        let dt_years = epoch_year - self.epoch;
        let cos_dec = self.dec.to_radians().cos();
        let (mu_ra, mu_dec) = if cos_dec.abs() > 0.05 {
            (
                self.pm_ra * MAS_TO_DEG / cos_dec,
                self.pm_dec * MAS_TO_DEG,
            )
        } else {
            (0.0, 0.0)
        };

        RefStar {
            ra: (self.ra + mu_ra * dt_years).rem_euclid(360.0),
            dec: self.dec + mu_dec * dt_years,
            epoch: epoch_year,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn measured(x: f64) -> MeasuredStar {
        MeasuredStar::new(
            1,
            Point::new(x, 0.0),
            0.01,
            0.01,
            0.0,
            Point::new(x, 0.0),
            1000.0,
            10.0,
            2.0,
        )
    }

    #[test]
    fn test_link_and_unlink_keep_counts() {
        let mut fitted = vec![
            FittedStar::new(SkyPoint::new(10.0, 10.0), 1.0),
            FittedStar::new(SkyPoint::new(11.0, 10.0), 1.0),
        ];
        let mut a = measured(1.0);
        let mut b = measured(2.0);
        link_fitted_star(&mut a, &mut fitted, FittedStarId(0));
        link_fitted_star(&mut b, &mut fitted, FittedStarId(0));
        assert_eq!(fitted[0].measurement_count, 2);

        // Relinking moves the count
        link_fitted_star(&mut b, &mut fitted, FittedStarId(1));
        assert_eq!(fitted[0].measurement_count, 1);
        assert_eq!(fitted[1].measurement_count, 1);

        unlink_fitted_star(&mut a, &mut fitted);
        assert_eq!(fitted[0].measurement_count, 0);
        assert_eq!(a.fitted_star(), None);
    }

    #[test]
    fn test_calibrated_flux_and_magnitudes() {
        let m = measured(0.0);
        assert_eq!(m.flux, 2000.0);
        assert_eq!(m.flux_err, 20.0);
        assert!((m.mag - flux_to_magnitude(2000.0)).abs() < 1e-12);
        assert!((m.inst_mag() + 7.5).abs() < 1e-12);
        assert!((magnitude_to_flux(flux_to_magnitude(3631e9)) - 3631e9).abs() < 1e-3);
        // 3631 Jy is AB magnitude 0
        assert!(flux_to_magnitude(3631e9).abs() < 1e-3);
    }

    #[test]
    fn test_proper_motion_propagation() {
        let star = RefStar {
            id: 7,
            ra: 100.0,
            dec: 60.0,
            ra_err: 0.0,
            dec_err: 0.0,
            flux: 1.0,
            flux_err: 0.1,
            pm_ra: 1000.0,
            pm_dec: -500.0,
            epoch: 2000.0,
        };
        let moved = star.propagated(2010.0);
        // 10 yr × 1"/yr / cos(60°) = 20" in RA
        assert!(((moved.ra - 100.0) * 3600.0 - 20.0).abs() < 1e-9);
        assert!(((moved.dec - 60.0) * 3600.0 + 5.0).abs() < 1e-9);
        assert_eq!(moved.epoch, 2010.0);

        let polar = RefStar { dec: 89.0, ..star };
        let moved = polar.propagated(2010.0);
        assert_eq!(moved.ra, 100.0);
        assert_eq!(moved.dec, 89.0);
    }
}
