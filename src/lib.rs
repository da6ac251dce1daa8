//! # jointcal
//!
//! **Joint astrometric and photometric calibration** of many overlapping CCD
//! exposures.
//!
//! Detections of the same star in different exposures are associated into
//! *fitted stars*, matched to an external *reference catalog*, and a sparse
//! least-squares fit then solves simultaneously for the per-exposure
//! mappings and for the star positions (or fluxes).
//!
//! ## Features
//!
//! - **Association**: grid-accelerated nearest-neighbor matching in a common
//!   tangent plane, with per-exposure ambiguity resolution
//! - **Models**: one polynomial per image, or a per-detector mapping composed
//!   with a per-exposure mapping; photometry in flux or in magnitude
//! - **Sparse Gauss–Newton** with a [`nalgebra-sparse`](https://docs.rs/nalgebra-sparse)
//!   Cholesky backend, parallel Jacobian assembly with [rayon](https://docs.rs/rayon)
//!   and iterative Mahalanobis outlier rejection
//! - **Proper motion**: reference positions are propagated to the epoch of
//!   the observations
//! - **Serialization**: the fitted calibration serializes with
//!   [rkyv](https://docs.rs/rkyv)
//!
//! ## Example
//!
//! ```no_run
//! use jointcal::{
//!     associate, fit_astrometry, fit_photometry, Associations, CalibrateConfig,
//!     CalibrationSolution, ReferenceCatalog,
//! };
//!
//! # fn inputs() -> (Associations, ReferenceCatalog) { unimplemented!() }
//! // One CcdImage per (visit, detector), built from detection records,
//! // an initial WCS and the exposure metadata.
//! let (mut associations, refcat) = inputs();
//! let config = CalibrateConfig::default();
//!
//! associate(&mut associations, &refcat, &config, true).unwrap();
//! let astrometry = fit_astrometry(&mut associations, &config).unwrap();
//! let photometry = fit_photometry(&mut associations, &config).unwrap();
//! println!("astrometry {}", astrometry.chi2);
//! println!("photometry {}", photometry.chi2);
//!
//! let solution = CalibrationSolution::from_models(
//!     &associations,
//!     astrometry.model.as_ref(),
//!     photometry.model.as_ref(),
//! )
//! .unwrap();
//! solution.save_to_file("calibration.rkyv").unwrap();
//! ```
//!
//! ## Algorithm overview
//!
//! 1. **Tangent point**: all images are projected onto one gnomonic plane
//!    centered on the mean of their sky centers
//! 2. **Association**: detections are merged image by image into the
//!    fitted-star list, then fitted stars are matched to reference stars
//! 3. **Selection**: fitted stars with too few measurements are dropped;
//!    the rest are initialized from the mean of their measurements
//! 4. **Fit**: partial fits (mappings only, stars only) followed by the joint
//!    fit, repeated while outliers are removed

pub mod associations;
pub mod calibrate;
pub mod ccd_image;
pub mod error;
pub mod finder;
pub mod fit;
pub mod geom;
pub mod mapping;
pub mod model;
pub mod reference;
pub mod solution;
pub mod star;
pub mod transform;

pub use associations::Associations;
pub use calibrate::{
    associate, fit_astrometry, fit_photometry, iterate_fit, AstrometryModelKind,
    AstrometryResult, CalibrateConfig, PhotometryModelKind, PhotometryResult,
};
pub use ccd_image::{CcdImage, CcdImageKey, CcdImageMetadata, DetectionRecord, PhotoCalib};
pub use error::{JointcalError, Result};
pub use fit::{
    AstrometryFit, Chi2Statistic, Fitter, LeastSquaresProblem, MinimizeResult, PhotometryFit,
};
pub use geom::{Frame, Point, SkyCircle, SkyPoint};
pub use model::{
    AstrometryModel, ConstrainedAstrometryModel, ConstrainedPhotometryModel, FitComponents,
    PhotometryKind, PhotometryModel, SimpleAstrometryModel, SimplePhotometryModel,
};
pub use reference::ReferenceCatalog;
pub use solution::{CalibrationSolution, CcdSolution};
pub use star::{FittedStar, FittedStarId, MeasuredStar, MeasuredStarId, RefStar, RefStarId};
pub use transform::{
    AstrometryPolynomial, AstrometryTransform, LinearTransform, PhotometryTransform, SipWcs,
    SkyWcs,
};
