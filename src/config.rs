//! Configuration module for Cairn.

use crate::error::{CairnError, Result};
use crate::protocol::{ELECTION_PORT, MAX_FOLLOWERS, MAX_PEERS, MAX_VOTERS, MESSAGE_PORT};
use crate::types::Fid;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for a Cairn node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CairnConfig {
    /// Node configuration.
    pub node: NodeConfig,
    /// Cluster membership.
    pub cluster: ClusterConfig,
    /// Network configuration.
    pub network: NetworkConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Observability configuration.
    pub observability: ObservabilityConfig,
}

impl CairnConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CairnError::Config(format!("failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| CairnError::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.node.fid.is_empty() {
            return Err(CairnError::InvalidConfig {
                field: "node.fid".to_string(),
                reason: "peer identity must be non-empty".to_string(),
            });
        }

        if self.cluster.peers.len() > MAX_PEERS {
            return Err(CairnError::InvalidConfig {
                field: "cluster.peers".to_string(),
                reason: format!("at most {} peers supported", MAX_PEERS),
            });
        }

        let voters = self.cluster.voters().count();
        if voters > MAX_VOTERS {
            return Err(CairnError::InvalidConfig {
                field: "cluster.peers".to_string(),
                reason: format!("at most {} voters supported", MAX_VOTERS),
            });
        }

        let followers = self.cluster.peers.len() - voters;
        if followers > MAX_FOLLOWERS {
            return Err(CairnError::InvalidConfig {
                field: "cluster.peers".to_string(),
                reason: format!("at most {} non-voting peers supported", MAX_FOLLOWERS),
            });
        }

        let mut seen = std::collections::HashSet::new();
        for peer in &self.cluster.peers {
            if !seen.insert(&peer.fid) {
                return Err(CairnError::InvalidConfig {
                    field: "cluster.peers".to_string(),
                    reason: format!("duplicate peer fid {:?}", peer.fid),
                });
            }
        }

        Ok(())
    }

    /// The endpoint record for this node, if it is a cluster member.
    pub fn self_endpoint(&self) -> Option<&PeerEndpoint> {
        self.cluster.peers.iter().find(|p| p.fid == self.node.fid)
    }

    /// Create a minimal single-node development configuration.
    pub fn development() -> Self {
        Self {
            node: NodeConfig {
                fid: "dev".to_string(),
                voting: true,
            },
            cluster: ClusterConfig {
                peers: vec![PeerEndpoint {
                    fid: "dev".to_string(),
                    election_addr: format!("127.0.0.1:{}", ELECTION_PORT),
                    message_addr: format!("127.0.0.1:{}", MESSAGE_PORT),
                    voting: true,
                }],
            },
            network: NetworkConfig::default(),
            storage: StorageConfig {
                data_dir: PathBuf::from("/tmp/cairn/data"),
            },
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Node-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This peer's cluster-unique identity.
    pub fid: Fid,
    /// Whether this peer participates in quorums. Watchers set `false`.
    pub voting: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            fid: "cairn-node".to_string(),
            voting: true,
        }
    }
}

/// One cluster member. The election and message endpoints of a peer travel
/// together so a UDP election winner maps to its TCP port without any
/// index arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEndpoint {
    /// Peer identity.
    pub fid: Fid,
    /// UDP address for election votes.
    pub election_addr: String,
    /// TCP address for protocol messages.
    pub message_addr: String,
    /// Whether this peer is part of the voting set.
    pub voting: bool,
}

/// Cluster membership configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// All known peers, voters and watchers alike.
    pub peers: Vec<PeerEndpoint>,
}

impl ClusterConfig {
    /// The voting subset of the cluster.
    pub fn voters(&self) -> impl Iterator<Item = &PeerEndpoint> {
        self.peers.iter().filter(|p| p.voting)
    }

    /// Look up a peer by identity.
    pub fn peer(&self, fid: &str) -> Option<&PeerEndpoint> {
        self.peers.iter().find(|p| p.fid == fid)
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Connection timeout for dialing a peer.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for the metadata store.
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/cairn"),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level.
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Serde helper for Duration using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        }
    }
}
