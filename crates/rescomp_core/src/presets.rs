use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::reservoir::Reservoir;

/// Serialized structural record of a reservoir. The current state and the
/// linker's used-channel bookkeeping are deliberately absent: a loaded
/// reservoir always starts fresh at `r_init`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservoirRecord {
    pub a: DMatrix<f64>,
    pub b: DMatrix<f64>,
    pub w: Option<DMatrix<f64>>,
    pub d: DVector<f64>,
    pub r_init: DVector<f64>,
    pub x_init: DVector<f64>,
    pub gamma: f64,
    pub global_timescale: f64,
    pub input_names: Vec<String>,
    pub output_names: Vec<String>,
}

impl From<&Reservoir> for ReservoirRecord {
    fn from(res: &Reservoir) -> Self {
        Self {
            a: res.a.clone(),
            b: res.b.clone(),
            w: res.w.clone(),
            d: res.d.clone(),
            r_init: res.r_init.clone(),
            x_init: res.x_init.clone(),
            gamma: res.gamma,
            global_timescale: res.global_timescale,
            input_names: res.input_names.clone(),
            output_names: res.output_names.clone(),
        }
    }
}

impl ReservoirRecord {
    pub fn into_reservoir(self) -> Result<Reservoir> {
        let mut res = Reservoir::with_bias(
            self.a,
            self.b,
            self.d,
            self.r_init,
            self.x_init,
            self.global_timescale,
            self.gamma,
        )?;
        if let Some(w) = self.w {
            res.set_readout(w)?;
        }
        res.set_input_names(self.input_names)?;
        res.set_output_names(self.output_names)?;
        Ok(res)
    }
}

impl Reservoir {
    /// Persists this reservoir's structural record into the named slot.
    pub fn save(&self, store: &PresetStore, name: &str) -> Result<()> {
        store.save(name, self)
    }

    /// Loads a reservoir from the named slot.
    pub fn load(store: &PresetStore, name: &str) -> Result<Reservoir> {
        store.load(name)
    }
}

/// Named slot store for reservoir records: one `<name>.rsvr` JSON file per
/// slot under a configurable directory.
#[derive(Debug, Clone)]
pub struct PresetStore {
    root: PathBuf,
}

impl Default for PresetStore {
    fn default() -> Self {
        Self::new("presets")
    }
}

impl PresetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn slot_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.rsvr"))
    }

    /// Serializes the reservoir's structural record into the named slot,
    /// creating the store directory if needed.
    pub fn save(&self, name: &str, reservoir: &Reservoir) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        let record = ReservoirRecord::from(reservoir);
        let file = File::create(self.slot_path(name))?;
        serde_json::to_writer(file, &record)?;
        Ok(())
    }

    /// Loads the named slot. A missing slot is a hard error, never a
    /// default.
    pub fn load(&self, name: &str) -> Result<Reservoir> {
        let path = self.slot_path(name);
        if !path.is_file() {
            return Err(Error::NotFound {
                name: name.to_string(),
                path,
            });
        }
        let file = File::open(&path)?;
        let record: ReservoirRecord = serde_json::from_reader(BufReader::new(file))?;
        record.into_reservoir()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slot_path(name).is_file()
    }
}
