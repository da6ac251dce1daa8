//! One detector of one exposure: its detections, initial WCS and metadata.

use std::fmt;

use tracing::debug;

use crate::error::{JointcalError, Result};
use crate::geom::{tan_project, Frame, Point, SkyPoint};
use crate::star::MeasuredStar;
use crate::transform::{AstrometryTransform, SkyWcs};

/// Identifies a CCD image by exposure (`visit`) and detector (`ccd`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CcdImageKey {
    pub visit: i64,
    pub ccd: i32,
}

impl fmt::Display for CcdImageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.visit, self.ccd)
    }
}

/// Input photometric calibration: calibrated flux (nJy) = instFlux × `mean`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhotoCalib {
    pub mean: f64,
    pub err: f64,
}

/// One row of an input detection catalog.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionRecord {
    pub id: u64,
    pub x: f64,
    pub y: f64,
    /// Centroid errors (px) and covariance (px²).
    pub x_err: f64,
    pub y_err: f64,
    pub xy_cov: f64,
    pub inst_flux: f64,
    pub inst_flux_err: f64,
    /// Nonzero marks a detection the source pipeline flagged as unusable.
    pub flags: u64,
}

/// Image metadata supplied alongside the detection catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct CcdImageMetadata {
    pub visit: i64,
    pub ccd: i32,
    pub filter: String,
    /// Pixel bounding box.
    pub bbox: Frame,
    pub photo_calib: PhotoCalib,
    /// Pixel → focal plane transform of this detector.
    pub pixel_to_focal: AstrometryTransform,
    /// Observation epoch, Julian year.
    pub epoch: f64,
}

/// A detection catalog plus everything needed to map it onto the sky.
#[derive(Debug)]
pub struct CcdImage {
    key: CcdImageKey,
    name: String,
    filter: String,
    bbox: Frame,
    wcs: SkyWcs,
    photo_calib: PhotoCalib,
    pixel_to_focal: AstrometryTransform,
    epoch: f64,
    whole_catalog: Vec<MeasuredStar>,
    catalog_for_fit: Vec<MeasuredStar>,
    common_tangent_point: Option<SkyPoint>,
}

impl CcdImage {
    /// Ingest a detection catalog.
    ///
    /// Flagged detections are skipped, as are those with a non-finite position
    /// or a flux or flux error that is non-finite or non-positive.
    pub fn new(records: &[DetectionRecord], wcs: SkyWcs, meta: CcdImageMetadata) -> Self {
        let key = CcdImageKey {
            visit: meta.visit,
            ccd: meta.ccd,
        };
        let calibration = meta.photo_calib.mean;

        let whole_catalog: Vec<MeasuredStar> = records
            .iter()
            .filter(|r| r.flags == 0)
            .filter(|r| r.x.is_finite() && r.y.is_finite())
            .filter(|r| r.inst_flux.is_finite() && r.inst_flux > 0.0)
            .filter(|r| r.inst_flux_err.is_finite() && r.inst_flux_err > 0.0)
            .map(|r| {
                let pixel = Point::new(r.x, r.y);
                MeasuredStar::new(
                    r.id,
                    pixel,
                    r.x_err * r.x_err,
                    r.y_err * r.y_err,
                    r.xy_cov,
                    meta.pixel_to_focal.apply(&pixel),
                    r.inst_flux,
                    r.inst_flux_err,
                    calibration,
                )
            })
            .collect();

        debug!(
            "CcdImage {}: kept {} of {} detections",
            key,
            whole_catalog.len(),
            records.len()
        );

        Self {
            key,
            name: key.to_string(),
            filter: meta.filter,
            bbox: meta.bbox,
            wcs,
            photo_calib: meta.photo_calib,
            pixel_to_focal: meta.pixel_to_focal,
            epoch: meta.epoch,
            catalog_for_fit: whole_catalog.clone(),
            whole_catalog,
            common_tangent_point: None,
        }
    }

    pub fn key(&self) -> CcdImageKey {
        self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn visit(&self) -> i64 {
        self.key.visit
    }

    pub fn ccd(&self) -> i32 {
        self.key.ccd
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    pub fn bbox(&self) -> &Frame {
        &self.bbox
    }

    pub fn wcs(&self) -> &SkyWcs {
        &self.wcs
    }

    pub fn photo_calib(&self) -> &PhotoCalib {
        &self.photo_calib
    }

    pub fn pixel_to_focal(&self) -> &AstrometryTransform {
        &self.pixel_to_focal
    }

    pub fn epoch(&self) -> f64 {
        self.epoch
    }

    pub fn whole_catalog(&self) -> &[MeasuredStar] {
        &self.whole_catalog
    }

    pub fn catalog_for_fit(&self) -> &[MeasuredStar] {
        &self.catalog_for_fit
    }

    pub fn catalog_for_fit_mut(&mut self) -> &mut [MeasuredStar] {
        &mut self.catalog_for_fit
    }

    /// Recopy the whole catalog into the fit catalog, dropping every link and
    /// validity change.
    pub fn reset_catalog_for_fit(&mut self) {
        self.catalog_for_fit = self.whole_catalog.clone();
    }

    /// Number of valid detections linked to a fitted star.
    pub fn count_valid_stars(&self) -> usize {
        self.catalog_for_fit
            .iter()
            .filter(|ms| ms.is_valid() && ms.fitted_star().is_some())
            .count()
    }

    /// Sky position of the bounding-box center through the initial WCS.
    pub fn sky_center(&self) -> SkyPoint {
        self.wcs.pixel_to_sky(&self.bbox.center())
    }

    pub fn set_common_tangent_point(&mut self, tangent_point: SkyPoint) {
        self.common_tangent_point = Some(tangent_point);
    }

    pub fn common_tangent_point(&self) -> Result<SkyPoint> {
        self.common_tangent_point
            .ok_or(JointcalError::TangentPointNotSet)
    }

    /// Map a pixel position into the common tangent plane through the initial
    /// WCS.
    pub fn pixel_to_common_tangent_plane(&self, p: &Point) -> Result<Point> {
        let tangent = self.common_tangent_point()?;
        let sky = self.wcs.pixel_to_sky(p);
        tan_project(&sky, &tangent).ok_or(JointcalError::Projection {
            ra: sky.ra,
            dec: sky.dec,
        })
    }
}
