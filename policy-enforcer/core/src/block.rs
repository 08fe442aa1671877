use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// An allocated address block, owned by exactly one tenant segment on one host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub cidr: IpNet,
    pub tenant: String,

    /// A block without a segment can't be placed in a tenant-segment set.
    #[serde(default)]
    pub segment: String,

    pub host: String,
}

/// The complete block assignment published by the control plane.
///
/// The revision is informational; the latest snapshot always wins.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlocksSnapshot {
    #[serde(default)]
    pub revision: u64,

    #[serde(default)]
    pub blocks: Vec<Block>,
}

impl Block {
    pub fn is_local(&self, hostname: &str) -> bool {
        self.host == hostname
    }
}

/// Returns the blocks owned by `hostname`.
pub fn local<'b>(blocks: &'b [Block], hostname: &'b str) -> impl Iterator<Item = &'b Block> {
    blocks.iter().filter(move |b| b.is_local(hostname))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_snapshot() {
        let snapshot: BlocksSnapshot = serde_json::from_str(
            r#"{
                "revision": 7,
                "blocks": [
                    {"cidr": "10.1.0.0/24", "tenant": "T1", "segment": "S1", "host": "h1"},
                    {"cidr": "10.1.1.0/24", "tenant": "T1", "host": "h2"}
                ]
            }"#,
        )
        .expect("snapshot must parse");
        assert_eq!(snapshot.revision, 7);
        assert_eq!(snapshot.blocks[1].segment, "");

        let hosts = local(&snapshot.blocks, "h1")
            .map(|b| b.cidr.to_string())
            .collect::<Vec<_>>();
        assert_eq!(hosts, vec!["10.1.0.0/24"]);
    }

    #[test]
    fn rejects_malformed_cidr() {
        let res = serde_json::from_str::<Block>(
            r#"{"cidr": "10.1.0.0/33", "tenant": "T1", "segment": "S1", "host": "h1"}"#,
        );
        assert!(res.is_err());
    }
}
