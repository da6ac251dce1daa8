//! Error type shared by the association, model and fit layers.

use thiserror::Error;

use crate::ccd_image::CcdImageKey;

/// Usage and precondition failures.
///
/// Numerical failure of a least-squares step is not an error: it is reported
/// as [`MinimizeResult::Failed`](crate::fit::MinimizeResult) so the caller can
/// decide whether to retry or abort.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum JointcalError {
    #[error("parameter vector has length {got}, expected {expected}")]
    SizeMismatch { expected: usize, got: usize },

    #[error("unknown fit component \"{0}\"")]
    UnknownFitComponent(String),

    #[error("no mapping has been built for ccd image {0}")]
    MappingNotFound(CcdImageKey),

    #[error("the common tangent point has not been set")]
    TangentPointNotSet,

    #[error("fitted stars must be selected before they are normalized")]
    FittedStarsNotSelected,

    #[error("the association has no ccd images")]
    NoCcdImages,

    #[error("reference catalog has no column \"{0}\"")]
    MissingReferenceField(String),

    #[error("position (ra={ra:.6}, dec={dec:.6}) is not projectable onto the tangent plane")]
    Projection { ra: f64, dec: f64 },

    #[error("transform is not invertible")]
    SingularTransform,

    #[error("polynomial fit failed: {0}")]
    PolynomialFit(String),

    #[error("\"{0}\" selects no free parameters")]
    NothingToFit(String),

    #[error("sparse system assembly failed: {0}")]
    SparseAssembly(String),
}

pub type Result<T> = std::result::Result<T, JointcalError>;
