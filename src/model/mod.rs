//! Models: one mapping per CCD image plus global parameter bookkeeping.
//!
//! A model owns the leaf mappings, hands out a mapping for each CCD image,
//! assigns global parameter indices for the components being fitted and
//! applies parameter updates. Leaves are visited in key order, so the index
//! layout only depends on the set of images.

pub mod astrometry;
pub mod photometry;

pub use astrometry::{AstrometryModel, ConstrainedAstrometryModel, SimpleAstrometryModel};
pub use photometry::{
    ConstrainedPhotometryModel, PhotometryKind, PhotometryModel, SimplePhotometryModel,
};

use nalgebra::DVector;

use crate::error::{JointcalError, Result};

/// Which blocks of parameters a fit step varies.
///
/// Parsed from a whitespace-separated list of component words. `chip` and
/// `visit` select the two mapping levels (a single-level model fits its
/// mappings when either is set); `stars` selects the per-star positions or
/// fluxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FitComponents {
    pub chip: bool,
    pub visit: bool,
    pub stars: bool,
}

impl FitComponents {
    /// Astrometry words: `Distortions`, `DistortionsChip`, `DistortionsVisit`,
    /// `Positions`.
    pub fn astrometry(what: &str) -> Result<Self> {
        Self::parse(what, "Distortions", "Positions")
    }

    /// Photometry words: `Model`, `ModelChip`, `ModelVisit`, `Fluxes`.
    pub fn photometry(what: &str) -> Result<Self> {
        Self::parse(what, "Model", "Fluxes")
    }

    fn parse(what: &str, model_word: &str, star_word: &str) -> Result<Self> {
        let mut out = FitComponents::default();
        for word in what.split_whitespace() {
            match word.strip_prefix(model_word) {
                Some("") => {
                    out.chip = true;
                    out.visit = true;
                }
                Some("Chip") => out.chip = true,
                Some("Visit") => out.visit = true,
                _ if word == star_word => out.stars = true,
                _ => return Err(JointcalError::UnknownFitComponent(word.to_string())),
            }
        }
        Ok(out)
    }

    /// True when any mapping level is varied.
    pub fn model(&self) -> bool {
        self.chip || self.visit
    }
}

/// Slice `delta[start..start + n]`, failing when `delta` is too short.
pub(crate) fn param_slice(delta: &DVector<f64>, start: usize, n: usize) -> Result<&[f64]> {
    delta
        .as_slice()
        .get(start..start + n)
        .ok_or(JointcalError::SizeMismatch {
            expected: start + n,
            got: delta.len(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_astrometry_words() {
        let c = FitComponents::astrometry("Distortions Positions").unwrap();
        assert_eq!(
            c,
            FitComponents {
                chip: true,
                visit: true,
                stars: true
            }
        );
        let c = FitComponents::astrometry("DistortionsVisit").unwrap();
        assert!(c.visit && !c.chip && !c.stars);
        let c = FitComponents::astrometry("  ").unwrap();
        assert!(!c.model() && !c.stars);
    }

    #[test]
    fn test_unknown_word_is_rejected() {
        assert_eq!(
            FitComponents::astrometry("Distortions Fluxes"),
            Err(JointcalError::UnknownFitComponent("Fluxes".into()))
        );
        assert_eq!(
            FitComponents::photometry("ModelSomething"),
            Err(JointcalError::UnknownFitComponent("ModelSomething".into()))
        );
        let c = FitComponents::photometry("ModelChip Fluxes").unwrap();
        assert!(c.chip && !c.visit && c.stars);
    }

    #[test]
    fn test_param_slice_bounds() {
        let delta = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        assert_eq!(param_slice(&delta, 1, 2).unwrap(), &[2.0, 3.0]);
        assert_eq!(
            param_slice(&delta, 2, 2),
            Err(JointcalError::SizeMismatch {
                expected: 4,
                got: 3
            })
        );
    }
}
