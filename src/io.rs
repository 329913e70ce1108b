//! Reading and writing parameter sets as structured configuration
//! documents.
//!
//! Documents carry the parameters under a `striae` section. Loading merges
//! recognized keys over the defaults and reports unrecognized ones instead
//! of failing.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::params::{FusionMode, Params, SensorModel, SetSpec};
use crate::stack::Dtype;

#[derive(thiserror::Error, Debug)]
pub enum PersistError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Toml(String),
    #[error("unsupported file extension '{0}', expected .json or .toml")]
    Format(String),
    #[error("document has no 'striae' section")]
    MissingSection,
}

#[derive(Serialize)]
struct Document<'a> {
    striae: &'a Params,
}

#[derive(Deserialize)]
struct DocumentPatch {
    striae: Option<ParamsPatch>,
}

/// Partial parameter set: every recognized key is optional, everything
/// else lands in `unknown` for reporting.
#[derive(Deserialize)]
struct ParamsPatch {
    height: Option<usize>,
    width: Option<usize>,
    sets: Option<Vec<Vec<SetSpec>>>,
    axis: Option<usize>,
    multiplex: Option<crate::mux::Multiplex>,
    dtype: Option<Dtype>,
    beta: Option<f64>,
    visibility: Option<f64>,
    phase_offset: Option<f64>,
    gamma: Option<f64>,
    reverse: Option<bool>,
    lmin: Option<f64>,
    vmin: Option<f64>,
    mode: Option<FusionMode>,
    sensor: Option<SensorModel>,
    #[serde(flatten)]
    unknown: BTreeMap<String, serde_json::Value>,
}

impl ParamsPatch {
    fn apply(self, params: &mut Params) {
        macro_rules! merge {
            ($($field:ident),*) => {
                $(if let Some(value) = self.$field {
                    params.$field = value;
                })*
            };
        }
        merge!(
            height,
            width,
            sets,
            axis,
            multiplex,
            dtype,
            beta,
            visibility,
            phase_offset,
            gamma,
            reverse,
            lmin,
            vmin,
            mode,
            sensor
        );

        for key in self.unknown.keys() {
            warn!("ignoring unrecognized parameter key '{key}'");
        }
    }
}

impl Params {
    /// Loads a parameter document, merging recognized keys over the
    /// defaults.
    ///
    /// The format follows the file extension: `.json` or `.toml`.
    pub fn load(path: impl AsRef<Path>) -> Result<Params, PersistError> {
        let path = path.as_ref();
        let format = extension(path)?;
        let raw = fs::read_to_string(path)?;

        let patch = match format {
            Ext::Json => serde_json::from_str::<DocumentPatch>(&raw)?,
            Ext::Toml => {
                toml::from_str::<DocumentPatch>(&raw).map_err(|e| PersistError::Toml(e.to_string()))?
            }
        };
        let patch = patch.striae.ok_or(PersistError::MissingSection)?;

        let mut params = Params::default();
        patch.apply(&mut params);
        info!("loaded parameters from {}", path.display());
        Ok(params)
    }

    /// Writes the parameter set to disk under a `striae` section.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), PersistError> {
        let path = path.as_ref();
        let document = Document { striae: self };

        let serialized = match extension(path)? {
            Ext::Json => serde_json::to_string_pretty(&document)?,
            Ext::Toml => {
                toml::to_string_pretty(&document).map_err(|e| PersistError::Toml(e.to_string()))?
            }
        };
        fs::write(path, serialized)?;
        info!("saved parameters to {}", path.display());
        Ok(())
    }
}

enum Ext {
    Json,
    Toml,
}

fn extension(path: &Path) -> Result<Ext, PersistError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Ok(Ext::Json),
        Some("toml") => Ok(Ext::Toml),
        other => Err(PersistError::Format(other.unwrap_or("").to_string())),
    }
}
