//! Data access for calibrated exposures and job products
//!
//! [`DataButler`] is the seam to whatever data-access layer holds the
//! exposures. [`FsButler`] is a directory-backed implementation: a rerun is a
//! directory with a `registry.json` describing every calibrated exposure, and
//! named datasets are stored as JSON files below it.

pub mod dataref;

pub use dataref::{share_data_refs, ButlerDataRef, DataRef, NodeDataRef, StubDataRef};

use crate::error::{ErrorCode, Result, StackError};
use crate::instrument::Instrument;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::OnceCell;
use tracing::debug;

/// Dataset holding calibrated exposures
pub const CALEXP: &str = "calexp";

pub const REGISTRY_FILE: &str = "registry.json";

/// Key/value identifier of one dataset instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataId(BTreeMap<String, Value>);

impl DataId {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// File-name stem, keys in sorted order: `filter-W-S-I+_stack-220`
    pub fn stem(&self) -> String {
        if self.0.is_empty() {
            return "default".to_string();
        }
        self.0
            .iter()
            .map(|(key, value)| match value {
                Value::String(s) => format!("{}-{}", key, s),
                other => format!("{}-{}", key, other),
            })
            .collect::<Vec<_>>()
            .join("_")
            .replace(['/', '\\'], "-")
    }
}

impl fmt::Display for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: Vec<String> = self
            .0
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();
        write!(f, "{{{}}}", pairs.join(", "))
    }
}

/// Metadata selection for exposures of one program
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataQuery {
    pub field: String,
    pub filter: String,
    pub date_obs: Option<String>,
}

impl MetadataQuery {
    pub fn new(field: &str, filter: &str, date_obs: Option<&str>) -> Self {
        Self {
            field: field.to_string(),
            filter: filter.to_string(),
            date_obs: date_obs.map(str::to_string),
        }
    }

    fn matches(&self, entry: &RegistryEntry) -> bool {
        entry.field == self.field
            && entry.filter == self.filter
            && self
                .date_obs
                .as_ref()
                .map_or(true, |date| entry.date_obs.as_ref() == Some(date))
    }
}

/// Data-access collaborator used by the driver and the engine
#[async_trait]
pub trait DataButler: Send + Sync {
    fn instrument(&self) -> Instrument;

    /// Directory the butler reads from and writes to
    fn root(&self) -> &Path;

    /// Distinct values of `key` (`visit` or `pointing`) for matching exposures, ascending
    async fn query_metadata(&self, dataset: &str, key: &str, query: &MetadataQuery)
        -> Result<Vec<i64>>;

    /// On-disk location of one calibrated exposure; the file may not exist
    async fn calexp_filename(&self, visit: i64, ccd: u32) -> Result<PathBuf>;

    async fn get(&self, dataset: &str, data_id: &DataId) -> Result<Value>;

    async fn put(&self, dataset: &str, data_id: &DataId, value: &Value) -> Result<()>;
}

/// One calibrated exposure as recorded in a rerun registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub visit: i64,
    pub ccd: u32,
    pub field: String,
    pub filter: String,
    #[serde(default)]
    pub date_obs: Option<String>,
    pub pointing: i64,
}

/// Directory-backed butler for one rerun
pub struct FsButler {
    instrument: Instrument,
    root: PathBuf,
    registry: OnceCell<Vec<RegistryEntry>>,
}

impl FsButler {
    pub fn new(instrument: Instrument, root: impl Into<PathBuf>) -> Self {
        Self {
            instrument,
            root: root.into(),
            registry: OnceCell::new(),
        }
    }

    /// Butler rooted at `{data_root}/rerun/{rerun}`
    pub fn for_rerun(instrument: Instrument, data_root: &Path, rerun: &str) -> Result<Self> {
        if rerun.trim().is_empty() || rerun.contains(['/', '\\']) || rerun == ".." {
            return Err(StackError::config_with_code(
                ErrorCode::CONFIG_INVALID_VALUE,
                format!("invalid rerun name: {:?}", rerun),
            ));
        }
        Ok(Self::new(instrument, data_root.join("rerun").join(rerun)))
    }

    async fn registry(&self) -> Result<&[RegistryEntry]> {
        let entries = self
            .registry
            .get_or_try_init(|| async {
                let path = self.root.join(REGISTRY_FILE);
                let content = fs::read_to_string(&path).await.map_err(|e| {
                    StackError::storage_with_code(
                        ErrorCode::STORAGE_NOT_FOUND,
                        "cannot read rerun registry",
                        Some(path.clone()),
                    )
                    .with_source(e)
                })?;
                let entries: Vec<RegistryEntry> = serde_json::from_str(&content).map_err(|e| {
                    StackError::storage_with_code(
                        ErrorCode::STORAGE_SERIALIZATION_ERROR,
                        "malformed rerun registry",
                        Some(path.clone()),
                    )
                    .with_source(e)
                })?;
                debug!("Loaded {} registry entries from {}", entries.len(), path.display());
                Ok::<_, StackError>(entries)
            })
            .await?;
        Ok(entries)
    }

    fn dataset_path(&self, dataset: &str, data_id: &DataId) -> PathBuf {
        self.root
            .join(dataset)
            .join(format!("{}.json", data_id.stem()))
    }
}

#[async_trait]
impl DataButler for FsButler {
    fn instrument(&self) -> Instrument {
        self.instrument
    }

    fn root(&self) -> &Path {
        &self.root
    }

    async fn query_metadata(
        &self,
        dataset: &str,
        key: &str,
        query: &MetadataQuery,
    ) -> Result<Vec<i64>> {
        if dataset != CALEXP {
            return Err(StackError::storage_with_code(
                ErrorCode::STORAGE_UNKNOWN_DATASET,
                format!("no metadata for dataset {}", dataset),
                None,
            ));
        }
        let select: fn(&RegistryEntry) -> i64 = match key {
            "visit" => |e| e.visit,
            "pointing" => |e| e.pointing,
            other => {
                return Err(StackError::storage_with_code(
                    ErrorCode::STORAGE_UNKNOWN_DATASET,
                    format!("unknown metadata key {}", other),
                    None,
                ))
            }
        };

        let values: BTreeSet<i64> = self
            .registry()
            .await?
            .iter()
            .filter(|entry| query.matches(entry))
            .map(select)
            .collect();
        Ok(values.into_iter().collect())
    }

    async fn calexp_filename(&self, visit: i64, ccd: u32) -> Result<PathBuf> {
        let entry = self
            .registry()
            .await?
            .iter()
            .find(|entry| entry.visit == visit && entry.ccd == ccd)
            .ok_or_else(|| {
                StackError::storage_with_code(
                    ErrorCode::STORAGE_NOT_FOUND,
                    format!("no calexp registered for visit {} ccd {}", visit, ccd),
                    None,
                )
            })?;
        Ok(self.root.join(self.instrument.calexp_path(
            entry.pointing,
            &entry.filter,
            visit,
            ccd,
        )))
    }

    async fn get(&self, dataset: &str, data_id: &DataId) -> Result<Value> {
        let path = self.dataset_path(dataset, data_id);
        let content = fs::read_to_string(&path).await.map_err(|e| {
            StackError::storage_with_code(
                ErrorCode::STORAGE_NOT_FOUND,
                format!("no {} for {}", dataset, data_id),
                Some(path.clone()),
            )
            .with_source(e)
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    async fn put(&self, dataset: &str, data_id: &DataId, value: &Value) -> Result<()> {
        let path = self.dataset_path(dataset, data_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(value)?;
        fs::write(&path, content).await.map_err(|e| {
            StackError::storage_with_code(
                ErrorCode::STORAGE_IO_ERROR,
                format!("cannot write {} for {}", dataset, data_id),
                Some(path.clone()),
            )
            .with_source(e)
        })?;
        debug!("Wrote {} to {}", dataset, path.display());
        Ok(())
    }
}
