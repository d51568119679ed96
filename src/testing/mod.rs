//! Test doubles for the butler and the engines
//!
//! These run a whole stacking job in-process: [`InMemoryButler`] serves a
//! registry held in memory (calexp files still live on disk so that file
//! checks behave as in production), [`RecordingEngine`] records every request
//! and answers from canned values.

use crate::butler::{DataButler, DataId, MetadataQuery, RegistryEntry, CALEXP};
use crate::engine::{
    FilterFramesRequest, FinalizeRequest, MeasureRequest, MosaicEngine, StackEngine, StackInit,
    StackInitRequest, TileRequest,
};
use crate::error::{ErrorCode, Result, StackError};
use crate::instrument::Instrument;
use crate::stack::{Collaborators, TileIndex, Wcs};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Registry entries for every `(visit, ccd)` of one pointing
pub fn calexp_entries(
    program: &str,
    filter: &str,
    pointing: i64,
    visits: &[i64],
    ccds: &[u32],
) -> Vec<RegistryEntry> {
    visits
        .iter()
        .flat_map(|&visit| {
            ccds.iter().map(move |&ccd| RegistryEntry {
                visit,
                ccd,
                field: program.to_string(),
                filter: filter.to_string(),
                date_obs: None,
                pointing,
            })
        })
        .collect()
}

pub struct InMemoryButler {
    instrument: Instrument,
    root: PathBuf,
    entries: Vec<RegistryEntry>,
    store: Mutex<HashMap<(String, String), Value>>,
}

impl InMemoryButler {
    pub fn new(instrument: Instrument, root: impl Into<PathBuf>) -> Self {
        Self {
            instrument,
            root: root.into(),
            entries: Vec::new(),
            store: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_entries(mut self, entries: Vec<RegistryEntry>) -> Self {
        self.entries.extend(entries);
        self
    }

    /// Create empty calexp files for every registered entry
    pub fn touch_calexps(&self) -> std::io::Result<()> {
        for entry in &self.entries {
            let path = self.root.join(self.instrument.calexp_path(
                entry.pointing,
                &entry.filter,
                entry.visit,
                entry.ccd,
            ));
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, b"")?;
        }
        Ok(())
    }

    /// Value last written through `put`
    pub fn stored(&self, dataset: &str, data_id: &DataId) -> Option<Value> {
        self.store
            .lock()
            .unwrap()
            .get(&(dataset.to_string(), data_id.stem()))
            .cloned()
    }
}

#[async_trait]
impl DataButler for InMemoryButler {
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
        let matching = self.entries.iter().filter(|e| {
            e.field == query.field
                && e.filter == query.filter
                && (query.date_obs.is_none() || e.date_obs == query.date_obs)
        });
        let values: BTreeSet<i64> = match key {
            "visit" => matching.map(|e| e.visit).collect(),
            "pointing" => matching.map(|e| e.pointing).collect(),
            other => {
                return Err(StackError::storage_with_code(
                    ErrorCode::STORAGE_UNKNOWN_DATASET,
                    format!("unknown metadata key {}", other),
                    None,
                ))
            }
        };
        Ok(values.into_iter().collect())
    }

    async fn calexp_filename(&self, visit: i64, ccd: u32) -> Result<PathBuf> {
        let entry = self
            .entries
            .iter()
            .find(|e| e.visit == visit && e.ccd == ccd)
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
        self.stored(dataset, data_id).ok_or_else(|| {
            StackError::storage_with_code(
                ErrorCode::STORAGE_NOT_FOUND,
                format!("no {} for {}", dataset, data_id),
                None,
            )
        })
    }

    async fn put(&self, dataset: &str, data_id: &DataId, value: &Value) -> Result<()> {
        self.store
            .lock()
            .unwrap()
            .insert((dataset.to_string(), data_id.stem()), value.clone());
        Ok(())
    }
}

#[derive(Default)]
struct EngineState {
    grid: (u32, u32),
    keep_visits: Option<Vec<i64>>,
    sigmas: HashMap<PathBuf, f64>,
    failing_tile: Option<TileIndex>,
    failing_file: Option<PathBuf>,
    filtered: Vec<FilterFramesRequest>,
    inits: Vec<StackInitRequest>,
    measured: Vec<MeasureRequest>,
    executed: Vec<TileRequest>,
    finalized: Vec<FinalizeRequest>,
}

/// Engine that records requests; clones share their recordings
#[derive(Clone)]
pub struct RecordingEngine {
    state: Arc<Mutex<EngineState>>,
}

impl RecordingEngine {
    /// A 2x2 grid that keeps every frame and measures nothing
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(EngineState {
                grid: (2, 2),
                ..EngineState::default()
            })),
        }
    }

    pub fn with_grid(self, nx: u32, ny: u32) -> Self {
        self.state.lock().unwrap().grid = (nx, ny);
        self
    }

    pub fn keeping_visits(self, visits: &[i64]) -> Self {
        self.state.lock().unwrap().keep_visits = Some(visits.to_vec());
        self
    }

    pub fn with_sigma(self, file: impl Into<PathBuf>, sigma: f64) -> Self {
        self.set_sigma(file, sigma);
        self
    }

    /// PSF width reported for `file`, for engines already shared with a fixture
    pub fn set_sigma(&self, file: impl Into<PathBuf>, sigma: f64) {
        self.state.lock().unwrap().sigmas.insert(file.into(), sigma);
    }

    pub fn failing_tile(self, tile: TileIndex) -> Self {
        self.state.lock().unwrap().failing_tile = Some(tile);
        self
    }

    pub fn failing_file(self, file: impl Into<PathBuf>) -> Self {
        self.state.lock().unwrap().failing_file = Some(file.into());
        self
    }

    pub fn filtered(&self) -> Vec<FilterFramesRequest> {
        self.state.lock().unwrap().filtered.clone()
    }

    pub fn inits(&self) -> Vec<StackInitRequest> {
        self.state.lock().unwrap().inits.clone()
    }

    pub fn measured(&self) -> Vec<MeasureRequest> {
        self.state.lock().unwrap().measured.clone()
    }

    pub fn executed(&self) -> Vec<TileRequest> {
        self.state.lock().unwrap().executed.clone()
    }

    pub fn finalized(&self) -> Vec<FinalizeRequest> {
        self.state.lock().unwrap().finalized.clone()
    }
}

impl Default for RecordingEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MosaicEngine for RecordingEngine {
    async fn filter_frames(
        &self,
        _butler: &dyn DataButler,
        visits: &[i64],
        ccds: &[u32],
        output_dir: &Path,
    ) -> Result<Vec<i64>> {
        let mut state = self.state.lock().unwrap();
        state.filtered.push(FilterFramesRequest {
            visits: visits.to_vec(),
            ccds: ccds.to_vec(),
            output_dir: output_dir.to_path_buf(),
        });
        Ok(match &state.keep_visits {
            Some(keep) => visits.iter().copied().filter(|v| keep.contains(v)).collect(),
            None => visits.to_vec(),
        })
    }
}

#[async_trait]
impl StackEngine for RecordingEngine {
    async fn stack_init(
        &self,
        _butler: &dyn DataButler,
        request: &StackInitRequest,
    ) -> Result<StackInit> {
        let mut state = self.state.lock().unwrap();
        state.inits.push(request.clone());
        let (nx, ny) = state.grid;
        Ok(StackInit {
            nx,
            ny,
            file_list: request.files.clone(),
            wcs: Wcs(json!({"ctype": ["RA---TAN", "DEC--TAN"], "crval": [150.0, 2.0]})),
        })
    }

    async fn measure_warped_psf(
        &self,
        _butler: &dyn DataButler,
        request: &MeasureRequest,
    ) -> Result<Option<f64>> {
        let mut state = self.state.lock().unwrap();
        state.measured.push(request.clone());
        if state.failing_file.as_ref() == Some(&request.file) {
            return Err(StackError::engine_with_code(
                ErrorCode::ENGINE_FAILED,
                format!("cannot warp {}", request.file.display()),
                Some("measure-psf".to_string()),
            ));
        }
        Ok(state.sigmas.get(&request.file).copied())
    }

    async fn stack_execute(&self, _butler: &dyn DataButler, request: &TileRequest) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.executed.push(request.clone());
        if state.failing_tile == Some(TileIndex { ix: request.ix, iy: request.iy }) {
            return Err(StackError::engine_with_code(
                ErrorCode::ENGINE_FAILED,
                format!("tile {},{} failed", request.ix, request.iy),
                Some("stack-execute".to_string()),
            ));
        }
        Ok(())
    }

    async fn stack_finalize(
        &self,
        _butler: &dyn DataButler,
        request: &FinalizeRequest,
    ) -> Result<()> {
        self.state.lock().unwrap().finalized.push(request.clone());
        Ok(())
    }
}

/// Collaborators sharing one in-memory butler and one recording engine
#[derive(Clone)]
pub struct TestCollaborators {
    butler: Arc<InMemoryButler>,
    engine: RecordingEngine,
    builds: Arc<AtomicUsize>,
}

impl TestCollaborators {
    pub fn new(engine: RecordingEngine) -> Self {
        Self::with_butler(InMemoryButler::new(Instrument::Hsc, "/nonexistent"), engine)
    }

    pub fn with_butler(butler: InMemoryButler, engine: RecordingEngine) -> Self {
        Self {
            butler: Arc::new(butler),
            engine,
            builds: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn butler_handle(&self) -> Arc<InMemoryButler> {
        Arc::clone(&self.butler)
    }

    /// How many times a butler was requested
    pub fn butlers_built(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl Collaborators for TestCollaborators {
    fn butler(&self, _instrument: Instrument, _rerun: &str) -> Result<Arc<dyn DataButler>> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::clone(&self.butler) as Arc<dyn DataButler>)
    }

    fn mosaic(&self) -> Arc<dyn MosaicEngine> {
        Arc::new(self.engine.clone())
    }

    fn stack(&self) -> Arc<dyn StackEngine> {
        Arc::new(self.engine.clone())
    }
}
