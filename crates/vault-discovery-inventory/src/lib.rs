//! Candidate node inventory
//!
//! Lists compute instances from the cloud inventory, applies the configured
//! tag/label/name filters and hands the surviving nodes to the election as
//! tunnel candidates.

mod filter;
mod gcloud;
mod node;

pub use filter::InstanceFilter;
pub use gcloud::GcloudInventory;
pub use node::{group_by_zone, CandidateNode, InstanceRecord};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("Inventory command `{command}` failed with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to decode inventory listing: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("No instances matched the configured filters in project {project}")]
    NoCandidates { project: String },
}

/// Source of compute instances for a project.
#[async_trait]
pub trait Inventory: Send + Sync {
    async fn list_instances(&self, project: &str) -> Result<Vec<InstanceRecord>, InventoryError>;
}

/// Fixed instance list, used when nodes are given on the command line.
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    instances: Vec<InstanceRecord>,
}

impl StaticInventory {
    pub fn new(instances: Vec<InstanceRecord>) -> Self {
        Self { instances }
    }
}

#[async_trait]
impl Inventory for StaticInventory {
    async fn list_instances(&self, _project: &str) -> Result<Vec<InstanceRecord>, InventoryError> {
        Ok(self.instances.clone())
    }
}

/// List, filter and order the election candidates for `project`.
///
/// An empty result is an error: there is nothing to elect from.
pub async fn discover_candidates<I>(
    inventory: &I,
    project: &str,
    filter: &InstanceFilter,
) -> Result<Vec<CandidateNode>, InventoryError>
where
    I: Inventory + ?Sized,
{
    let instances = inventory.list_instances(project).await?;
    let listed = instances.len();

    let mut candidates: Vec<CandidateNode> = instances
        .iter()
        .filter(|instance| filter.matches(instance))
        .map(CandidateNode::from)
        .collect();
    candidates.sort();
    candidates.dedup();

    debug!(
        project = %project,
        listed,
        matched = candidates.len(),
        "Filtered inventory"
    );

    if candidates.is_empty() {
        return Err(InventoryError::NoCandidates {
            project: project.to_string(),
        });
    }

    for (zone, nodes) in group_by_zone(&candidates) {
        info!(zone = %zone, nodes = ?nodes, "Candidate nodes");
    }

    Ok(candidates)
}
