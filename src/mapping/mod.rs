//! Transforms bound to slices of the global parameter vector.
//!
//! A leaf mapping owns one transform, an optional frozen error transform,
//! the index of its first parameter and a fixed flag. Models own the leaves;
//! the two-level chip/visit mappings only borrow them, so a leaf shared by
//! many CCD images is updated once per step.

pub mod astrometry;
pub mod photometry;

pub use astrometry::{AstrometryMappingRef, ChipVisitAstrometryMapping, SimpleAstrometryMapping};
pub use photometry::{ChipVisitPhotometryMapping, PhotometryMappingRef, SimplePhotometryMapping};
