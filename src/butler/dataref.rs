//! Data references handed to every rank
//!
//! Only the root reads the registry. Other ranks receive the root's list of
//! data ids and hold [`StubDataRef`]s for them, so per-reference work runs the
//! same number of times everywhere without every rank touching storage.

use super::{DataButler, DataId};
use crate::comm::Comm;
use crate::error::{ErrorCode, Result, StackError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::trace;

#[async_trait]
pub trait DataRef: Send + Sync {
    fn data_id(&self) -> &DataId;

    async fn get(&self, dataset: &str) -> Result<Value>;

    async fn put(&self, dataset: &str, value: &Value) -> Result<()>;
}

/// Reference backed by a real butler
#[derive(Clone)]
pub struct ButlerDataRef {
    butler: Arc<dyn DataButler>,
    data_id: DataId,
}

impl ButlerDataRef {
    pub fn new(butler: Arc<dyn DataButler>, data_id: DataId) -> Self {
        Self { butler, data_id }
    }
}

#[async_trait]
impl DataRef for ButlerDataRef {
    fn data_id(&self) -> &DataId {
        &self.data_id
    }

    async fn get(&self, dataset: &str) -> Result<Value> {
        self.butler.get(dataset, &self.data_id).await
    }

    async fn put(&self, dataset: &str, value: &Value) -> Result<()> {
        self.butler.put(dataset, &self.data_id, value).await
    }
}

/// Reference held by non-root ranks: writes are dropped, reads fail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StubDataRef {
    data_id: DataId,
}

impl StubDataRef {
    pub fn new(data_id: DataId) -> Self {
        Self { data_id }
    }
}

#[async_trait]
impl DataRef for StubDataRef {
    fn data_id(&self) -> &DataId {
        &self.data_id
    }

    async fn get(&self, dataset: &str) -> Result<Value> {
        Err(StackError::storage_with_code(
            ErrorCode::STORAGE_READ_ONLY,
            format!(
                "nodes should not be reading through this data reference ({} for {})",
                dataset, self.data_id
            ),
            None,
        ))
    }

    async fn put(&self, dataset: &str, _value: &Value) -> Result<()> {
        trace!("Dropping {} write for {} on a stub reference", dataset, self.data_id);
        Ok(())
    }
}

/// The reference a rank ends up holding
#[derive(Clone)]
pub enum NodeDataRef {
    Butler(ButlerDataRef),
    Stub(StubDataRef),
}

impl NodeDataRef {
    pub fn is_stub(&self) -> bool {
        matches!(self, NodeDataRef::Stub(_))
    }
}

#[async_trait]
impl DataRef for NodeDataRef {
    fn data_id(&self) -> &DataId {
        match self {
            NodeDataRef::Butler(r) => r.data_id(),
            NodeDataRef::Stub(r) => r.data_id(),
        }
    }

    async fn get(&self, dataset: &str) -> Result<Value> {
        match self {
            NodeDataRef::Butler(r) => r.get(dataset).await,
            NodeDataRef::Stub(r) => r.get(dataset).await,
        }
    }

    async fn put(&self, dataset: &str, value: &Value) -> Result<()> {
        match self {
            NodeDataRef::Butler(r) => r.put(dataset, value).await,
            NodeDataRef::Stub(r) => r.put(dataset, value).await,
        }
    }
}

/// Give every rank one reference per data id known to the root.
///
/// The root passes its butler and ids and gets butler-backed references;
/// every other rank passes `None` for both and gets stubs for the same ids.
pub async fn share_data_refs(
    comm: &Comm,
    root: usize,
    butler: Option<Arc<dyn DataButler>>,
    ids: Option<Vec<DataId>>,
) -> Result<Vec<NodeDataRef>> {
    let ids = comm.broadcast(ids, root).await?;

    if !comm.is_root(root) {
        return Ok(ids
            .into_iter()
            .map(|id| NodeDataRef::Stub(StubDataRef::new(id)))
            .collect());
    }

    let butler = butler.ok_or_else(|| {
        StackError::config_with_code(
            ErrorCode::CONFIG_MISSING_REQUIRED,
            "root needs a butler to share data references",
        )
    })?;
    Ok(ids
        .into_iter()
        .map(|id| NodeDataRef::Butler(ButlerDataRef::new(Arc::clone(&butler), id)))
        .collect())
}
