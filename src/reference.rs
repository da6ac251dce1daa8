//! Column-oriented reference catalog with named flux fields.

use std::collections::BTreeMap;

use crate::error::{JointcalError, Result};
use crate::star::RefStar;

/// Reference catalog as parallel columns.
///
/// Positions are in degrees, position errors in degrees, proper motions in
/// mas/yr (RA component including cos(dec)). Fluxes are stored per field under
/// the column names `<field>_flux` and `<field>_fluxErr`.
#[derive(Debug, Clone, Default)]
pub struct ReferenceCatalog {
    pub id: Vec<u64>,
    pub ra: Vec<f64>,
    pub dec: Vec<f64>,
    pub ra_err: Option<Vec<f64>>,
    pub dec_err: Option<Vec<f64>>,
    pub pm_ra: Option<Vec<f64>>,
    pub pm_dec: Option<Vec<f64>>,
    /// Julian year of the positions.
    pub epoch: f64,
    columns: BTreeMap<String, Vec<f64>>,
}

impl ReferenceCatalog {
    pub fn new(id: Vec<u64>, ra: Vec<f64>, dec: Vec<f64>, epoch: f64) -> Self {
        assert_eq!(id.len(), ra.len(), "id and ra columns differ in length");
        assert_eq!(ra.len(), dec.len(), "ra and dec columns differ in length");
        Self {
            id,
            ra,
            dec,
            epoch,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.ra.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ra.is_empty()
    }

    /// Add (or replace) a named column.
    pub fn set_column(&mut self, name: &str, values: Vec<f64>) {
        assert_eq!(values.len(), self.len(), "column \"{name}\" has the wrong length");
        self.columns.insert(name.to_string(), values);
    }

    /// Add the `<field>_flux` / `<field>_fluxErr` pair.
    pub fn set_flux_field(&mut self, field: &str, flux: Vec<f64>, flux_err: Vec<f64>) {
        self.set_column(&format!("{field}_flux"), flux);
        self.set_column(&format!("{field}_fluxErr"), flux_err);
    }

    pub fn column(&self, name: &str) -> Result<&[f64]> {
        self.columns
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| JointcalError::MissingReferenceField(name.to_string()))
    }

    /// Build [`RefStar`]s using the flux columns of `flux_field`.
    pub fn ref_stars(&self, flux_field: &str) -> Result<Vec<RefStar>> {
        let flux = self.column(&format!("{flux_field}_flux"))?;
        let flux_err = self.column(&format!("{flux_field}_fluxErr"))?;

        let at = |col: &Option<Vec<f64>>, i: usize| col.as_ref().map_or(0.0, |c| c[i]);
        Ok((0..self.len())
            .map(|i| RefStar {
                id: self.id[i],
                ra: self.ra[i],
                dec: self.dec[i],
                ra_err: at(&self.ra_err, i),
                dec_err: at(&self.dec_err, i),
                flux: flux[i],
                flux_err: flux_err[i],
                pm_ra: at(&self.pm_ra, i),
                pm_dec: at(&self.pm_dec, i),
                epoch: self.epoch,
            })
            .collect())
    }

    /// Copy with positions moved to `epoch_year` by proper motion.
    ///
    /// Catalogs without proper-motion columns are returned unchanged apart
    /// from the epoch label.
    pub fn propagated_to(&self, epoch_year: f64) -> ReferenceCatalog {
        let mut out = self.clone();
        out.epoch = epoch_year;
        if self.pm_ra.is_none() && self.pm_dec.is_none() {
            return out;
        }
        for i in 0..self.len() {
            let star = RefStar {
                id: self.id[i],
                ra: self.ra[i],
                dec: self.dec[i],
                ra_err: 0.0,
                dec_err: 0.0,
                flux: 0.0,
                flux_err: 0.0,
                pm_ra: self.pm_ra.as_ref().map_or(0.0, |c| c[i]),
                pm_dec: self.pm_dec.as_ref().map_or(0.0, |c| c[i]),
                epoch: self.epoch,
            }
            .propagated(epoch_year);
            out.ra[i] = star.ra;
            out.dec[i] = star.dec;
        }
        out
    }
}
