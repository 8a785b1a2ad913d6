use crate::{InstanceRecord, Inventory, InventoryError};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Lists instances through `gcloud compute instances list`.
#[derive(Debug, Clone)]
pub struct GcloudInventory {
    program: PathBuf,
}

impl GcloudInventory {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn args(project: &str) -> Vec<String> {
        vec![
            "compute".to_string(),
            "instances".to_string(),
            "list".to_string(),
            "--project".to_string(),
            project.to_string(),
            "--format=json".to_string(),
        ]
    }
}

#[async_trait]
impl Inventory for GcloudInventory {
    async fn list_instances(&self, project: &str) -> Result<Vec<InstanceRecord>, InventoryError> {
        let args = Self::args(project);
        debug!(program = %self.program.display(), ?args, "Listing instances");

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            return Err(InventoryError::CommandFailed {
                command: format!("{} {}", self.program.display(), args.join(" ")),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        parse_listing(&output.stdout)
    }
}

fn parse_listing(stdout: &[u8]) -> Result<Vec<InstanceRecord>, InventoryError> {
    // gcloud prints nothing at all for an empty project on some versions.
    if stdout.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_slice(stdout)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args() {
        assert_eq!(
            GcloudInventory::args("my-project").join(" "),
            "compute instances list --project my-project --format=json"
        );
    }

    #[test]
    fn test_parse_listing() {
        let stdout = br#"[
            {"name": "vault-1", "zone": "projects/p/zones/europe-west1-b", "tags": {"items": ["vault"]}},
            {"name": "vault-2", "zone": "projects/p/zones/europe-west1-c"}
        ]"#;
        let records = parse_listing(stdout).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].zone, "europe-west1-c");
    }

    #[test]
    fn test_parse_empty_listing() {
        assert!(parse_listing(b"").unwrap().is_empty());
        assert!(parse_listing(b"[]").unwrap().is_empty());
        assert!(parse_listing(b"not json").is_err());
    }
}
