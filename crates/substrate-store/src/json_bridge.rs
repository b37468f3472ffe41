use std::fs;
use std::path::Path;

use substrate_core::PartitionState;

use crate::error::{Result, StoreError};
use crate::store::Store;

impl Store {
    /// Replace this store's partition with the one in a JSON export file.
    pub fn import_json_file(&self, path: &Path) -> Result<()> {
        let json = fs::read_to_string(path).map_err(|e| {
            StoreError::InvalidData(format!("failed to read {}: {e}", path.display()))
        })?;
        self.import_json_str(&json)
    }

    pub fn import_json_str(&self, json: &str) -> Result<()> {
        let state: PartitionState = serde_json::from_str(json)
            .map_err(|e| StoreError::InvalidData(format!("invalid JSON: {e}")))?;
        self.save_partition(&state)?;
        tracing::info!(
            tenant = %state.tenant,
            nodes = state.graph.nodes.len(),
            entities = state.entities.entities.len(),
            "partition imported"
        );
        Ok(())
    }

    pub fn export_json_file(&self, path: &Path) -> Result<()> {
        let json = self.export_json_string()?;
        fs::write(path, json).map_err(|e| {
            StoreError::InvalidData(format!("failed to write {}: {e}", path.display()))
        })
    }

    /// The whole partition, current versions and history, as pretty JSON.
    pub fn export_json_string(&self) -> Result<String> {
        let state = self.load_partition()?;
        serde_json::to_string_pretty(&state)
            .map_err(|e| StoreError::InvalidData(format!("JSON export failed: {e}")))
    }
}
