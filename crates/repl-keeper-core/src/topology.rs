//! # Cluster Topology
//!
//! Named bus clusters and the clients used to reach them.
//!
//! The topology file is YAML:
//!
//! ```yaml
//! clusters:
//!   primary:
//!     brokers:
//!       - kafka-a.internal:9092
//!   standby:
//!     brokers: ["kafka-b.internal:9092"]
//! ```

use crate::config::AdminConfig;
use crate::AdminError;
use bus_runtime::{
    BusClient, BusClientFactory, BusConfig, InMemoryConfig, KafkaConfig, ProviderConfig,
    ProviderType,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::info;

#[cfg(test)]
#[path = "topology_tests.rs"]
mod tests;

/// Broker addresses of one cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub brokers: Vec<String>,
}

/// Mapping of cluster name to broker list
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClusterTopology {
    pub clusters: BTreeMap<String, ClusterConfig>,
}

impl ClusterTopology {
    /// Parse and validate a topology document
    pub fn from_yaml_str(yaml: &str) -> Result<Self, AdminError> {
        let topology: Self = serde_yaml::from_str(yaml).map_err(|e| {
            AdminError::invalid_configuration(format!("invalid cluster topology: {}", e))
        })?;
        topology.validate()?;
        Ok(topology)
    }

    /// Read and validate a topology file
    pub async fn load(path: &Path) -> Result<Self, AdminError> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            AdminError::invalid_configuration(format!(
                "cannot read cluster topology {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), AdminError> {
        for (name, cluster) in &self.clusters {
            if cluster.brokers.is_empty() {
                return Err(AdminError::invalid_configuration(format!(
                    "cluster '{}' lists no brokers",
                    name
                )));
            }
            for broker in &cluster.brokers {
                if broker.is_empty() || broker.chars().any(char::is_whitespace) {
                    return Err(AdminError::invalid_configuration(format!(
                        "cluster '{}' has invalid broker address '{}'",
                        name, broker
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn cluster(&self, name: &str) -> Result<&ClusterConfig, AdminError> {
        self.clusters.get(name).ok_or_else(|| {
            AdminError::invalid_configuration(format!(
                "cluster '{}' is not defined in the topology",
                name
            ))
        })
    }
}

/// Bus clients keyed by cluster name
#[derive(Debug, Clone, Default)]
pub struct ClusterConnections {
    clients: HashMap<String, BusClient>,
}

impl ClusterConnections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect to the named clusters of a topology.
    ///
    /// Only the listed clusters are connected so an unrelated entry cannot
    /// fail the command.
    pub fn connect(
        topology: &ClusterTopology,
        names: &[&str],
        config: &AdminConfig,
    ) -> Result<Self, AdminError> {
        let mut connections = Self::new();
        for name in names {
            if connections.clients.contains_key(*name) {
                continue;
            }
            let cluster = topology.cluster(name)?;
            let provider = match config.bus_provider {
                ProviderType::Kafka => ProviderConfig::Kafka(KafkaConfig::new(cluster.brokers.clone())),
                ProviderType::InMemory => ProviderConfig::InMemory(InMemoryConfig::default()),
            };
            let client = BusClientFactory::create_client(BusConfig {
                provider,
                operation_timeout: config.bus_timeout(),
                pool_size: config.pool_size,
            })?;

            info!(
                cluster = %name,
                provider = %config.bus_provider,
                brokers = cluster.brokers.len(),
                "Connected to cluster"
            );
            connections.insert(*name, client);
        }
        Ok(connections)
    }

    pub fn insert(&mut self, name: impl Into<String>, client: BusClient) {
        self.clients.insert(name.into(), client);
    }

    pub fn client(&self, name: &str) -> Result<&BusClient, AdminError> {
        self.clients.get(name).ok_or_else(|| {
            AdminError::invalid_configuration(format!("no connection to cluster '{}'", name))
        })
    }
}
