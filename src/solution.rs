//! Calibrated output: per-image pixel → sky mapping and photometric
//! calibration, serializable with rkyv.

use rkyv::{Archive, Deserialize, Serialize};
use tracing::info;

use crate::associations::Associations;
use crate::ccd_image::{CcdImageKey, PhotoCalib};
use crate::error::Result;
use crate::geom::{Point, SkyPoint};
use crate::model::{AstrometryModel, PhotometryModel};
use crate::transform::{AstrometryPolynomial, AstrometryTransform, SkyWcs};

/// Fitted calibration of one CCD image.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct CcdSolution {
    pub visit: i64,
    pub ccd: i32,
    /// Tangent point of the pixel → sky mapping (degrees).
    pub tangent_ra: f64,
    pub tangent_dec: f64,
    /// Order of the pixel → tangent-plane polynomial.
    pub order: u32,
    /// Polynomial coefficients: all x terms, then all y terms, by total
    /// degree and decreasing power of x. Output in degrees.
    pub coefficients: Vec<f64>,
    /// Mean calibration, nJy per instrumental count.
    pub calib_mean: f64,
    pub calib_err: f64,
}

impl CcdSolution {
    pub fn key(&self) -> CcdImageKey {
        CcdImageKey {
            visit: self.visit,
            ccd: self.ccd,
        }
    }

    pub fn sky_wcs(&self) -> SkyWcs {
        let poly = AstrometryPolynomial::from_coefficients(self.order, self.coefficients.clone());
        SkyWcs::new(
            SkyPoint::new(self.tangent_ra, self.tangent_dec),
            AstrometryTransform::Polynomial(poly),
        )
    }

    pub fn pixel_to_sky(&self, p: &Point) -> SkyPoint {
        self.sky_wcs().pixel_to_sky(p)
    }

    pub fn photo_calib(&self) -> PhotoCalib {
        PhotoCalib {
            mean: self.calib_mean,
            err: self.calib_err,
        }
    }
}

/// Result of a calibration run, one entry per CCD image in association
/// order.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct CalibrationSolution {
    pub ccds: Vec<CcdSolution>,
}

impl CalibrationSolution {
    /// Export the fitted mappings and calibrations of every image.
    pub fn from_models(
        associations: &Associations,
        astrometry: &dyn AstrometryModel,
        photometry: &dyn PhotometryModel,
    ) -> Result<Self> {
        let ccds = associations
            .ccd_images()
            .iter()
            .map(|ccd| {
                let wcs = astrometry.make_sky_wcs(ccd)?;
                let poly = wcs.pixel_to_tangent_plane().to_polynomial();
                let calib = photometry.calibration(ccd)?;
                Ok(CcdSolution {
                    visit: ccd.visit(),
                    ccd: ccd.ccd(),
                    tangent_ra: wcs.tangent_point().ra,
                    tangent_dec: wcs.tangent_point().dec,
                    order: poly.order(),
                    coefficients: poly.coefficients().to_vec(),
                    calib_mean: calib.mean,
                    calib_err: calib.err,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { ccds })
    }

    pub fn get(&self, key: CcdImageKey) -> Option<&CcdSolution> {
        self.ccds.iter().find(|c| c.key() == key)
    }

    /// Serialize the solution to bytes using rkyv.
    pub fn to_rkyv_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map_err(|e| anyhow::anyhow!("rkyv serialization failed: {}", e))?;
        Ok(bytes.to_vec())
    }

    pub fn from_rkyv_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| anyhow::anyhow!("rkyv deserialization failed: {}", e))
    }

    /// Save the solution to a file using rkyv.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let bytes = self.to_rkyv_bytes()?;
        std::fs::write(path, &bytes)?;
        info!("Saved calibration to {} ({} bytes)", path, bytes.len());
        Ok(())
    }

    /// Load a solution from an rkyv file.
    pub fn load_from_file(path: &str) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path)?;
        let solution = Self::from_rkyv_bytes(&bytes)?;
        info!("Loaded calibration: {} CcdImages", solution.ccds.len());
        Ok(solution)
    }
}
