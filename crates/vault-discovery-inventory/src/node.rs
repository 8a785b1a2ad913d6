use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

/// A compute instance as reported by the inventory, before filtering.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InstanceRecord {
    pub name: String,
    #[serde(deserialize_with = "zone_from_url")]
    pub zone: String,
    #[serde(default, deserialize_with = "tag_items")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// A node the election will try to tunnel to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CandidateNode {
    // Field order gives the (zone, name) sort order.
    pub zone: String,
    pub name: String,
}

impl CandidateNode {
    pub fn new(name: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            zone: zone.into(),
        }
    }
}

impl From<&InstanceRecord> for CandidateNode {
    fn from(record: &InstanceRecord) -> Self {
        Self::new(record.name.clone(), record.zone.clone())
    }
}

impl fmt::Display for CandidateNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.zone, self.name)
    }
}

/// Parses `zone/name`, the form used by `--instance`.
impl FromStr for CandidateNode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((zone, name)) if !zone.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(name, zone))
            }
            _ => Err(format!(
                "Invalid instance '{}' (expected format: zone/name)",
                s
            )),
        }
    }
}

impl From<CandidateNode> for InstanceRecord {
    fn from(node: CandidateNode) -> Self {
        Self {
            name: node.name,
            zone: node.zone,
            tags: Vec::new(),
            labels: HashMap::new(),
        }
    }
}

/// Zone-grouped view of the candidates, zones in lexical order.
pub fn group_by_zone(nodes: &[CandidateNode]) -> BTreeMap<String, Vec<String>> {
    let mut zones: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for node in nodes {
        zones
            .entry(node.zone.clone())
            .or_default()
            .push(node.name.clone());
    }
    zones
}

/// The API reports zones as URLs (`.../projects/p/zones/europe-west1-b`) or
/// as `zones/europe-west1-b`; keep the bare zone name.
fn zone_from_url<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(raw.rsplit('/').next().unwrap_or_default().to_string())
}

fn tag_items<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Tags {
        #[serde(default)]
        items: Vec<String>,
    }

    Ok(Option::<Tags>::deserialize(deserializer)?
        .map(|tags| tags.items)
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_gcloud_instance() {
        let json = r#"{
            "name": "vault-1",
            "zone": "https://www.googleapis.com/compute/v1/projects/p/zones/europe-west1-b",
            "status": "RUNNING",
            "tags": {"items": ["vault", "ssh"], "fingerprint": "abc"},
            "labels": {"role": "vault"}
        }"#;

        let record: InstanceRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.name, "vault-1");
        assert_eq!(record.zone, "europe-west1-b");
        assert_eq!(record.tags, vec!["vault", "ssh"]);
        assert_eq!(record.labels.get("role").map(String::as_str), Some("vault"));
    }

    #[test]
    fn test_decode_without_tags_or_labels() {
        let json = r#"{"name": "vault-1", "zone": "zones/us-east1-c"}"#;
        let record: InstanceRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.zone, "us-east1-c");
        assert!(record.tags.is_empty());
        assert!(record.labels.is_empty());
    }

    #[test]
    fn test_parse_candidate() {
        let node: CandidateNode = "europe-west1-b/vault-1".parse().unwrap();
        assert_eq!(node.zone, "europe-west1-b");
        assert_eq!(node.name, "vault-1");
        assert_eq!(node.to_string(), "europe-west1-b/vault-1");

        assert!("vault-1".parse::<CandidateNode>().is_err());
        assert!("/vault-1".parse::<CandidateNode>().is_err());
        assert!("zone/".parse::<CandidateNode>().is_err());
        assert!("a/b/c".parse::<CandidateNode>().is_err());
    }

    #[test]
    fn test_group_by_zone() {
        let nodes = vec![
            CandidateNode::new("vault-1", "b"),
            CandidateNode::new("vault-2", "a"),
            CandidateNode::new("vault-3", "b"),
        ];
        let zones = group_by_zone(&nodes);
        assert_eq!(zones.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(zones["b"], vec!["vault-1", "vault-3"]);
    }
}
