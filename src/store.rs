use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use thiserror::Error;
use tracing::debug;

use crate::config::Param;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("store image is not a flat key/value map")]
    Corrupt,
}

/// Flat key→value tunable store. Mutated only through the parameter-set
/// path; each write clamps to the documented range and lands as one
/// atomic file replacement so a power cut never leaves a torn image.
#[derive(Debug, Default)]
pub struct FlatStore {
    values: HashMap<String, f64>,
    path: Option<PathBuf>,
}

impl FlatStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open a file-backed store, loading the previous image if present.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let values = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str::<HashMap<String, f64>>(&raw)
                .map_err(|_| StoreError::Corrupt)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            values,
            path: Some(path),
        })
    }

    /// Current value, falling back to the parameter default when unset.
    pub fn get(&self, param: Param) -> f64 {
        self.values
            .get(param.wire_name())
            .copied()
            .unwrap_or_else(|| param.default_value())
    }

    /// Clamp and persist a single value. Returns the value as stored.
    pub fn set(&mut self, param: Param, value: f64) -> Result<f64, StoreError> {
        let clamped = param.clamp(value);
        if clamped != value {
            debug!(param = param.wire_name(), value, clamped, "clamped out-of-range parameter");
        }
        self.values.insert(param.wire_name().to_string(), clamped);
        self.persist()?;
        Ok(clamped)
    }

    /// Stage every entry, then persist the batch as one atomic write.
    pub fn set_many(&mut self, entries: &[(Param, f64)]) -> Result<(), StoreError> {
        for (param, value) in entries {
            self.values
                .insert(param.wire_name().to_string(), param.clamp(*value));
        }
        self.persist()
    }

    /// Raw access for derived persisted values (calibration outputs) that
    /// are not operator tunables.
    pub fn get_raw(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    pub fn set_raw(&mut self, key: &str, value: f64) -> Result<(), StoreError> {
        self.values.insert(key.to_string(), value);
        self.persist()
    }

    fn persist(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let image = serde_json::to_string_pretty(&self.values).map_err(|_| StoreError::Corrupt)?;
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(image.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }
}
