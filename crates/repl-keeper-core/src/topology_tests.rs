//! Tests for cluster topology parsing and connections.

use super::*;
use std::io::Write;
use tempfile::NamedTempFile;

const TOPOLOGY: &str = r#"
clusters:
  primary:
    brokers:
      - kafka-a.internal:9092
      - kafka-b.internal:9092
  standby:
    brokers: ["kafka-c.internal:9092"]
"#;

fn in_memory_config() -> AdminConfig {
    AdminConfig {
        bus_provider: ProviderType::InMemory,
        ..AdminConfig::default()
    }
}

#[test]
fn test_parse_topology() {
    let topology = ClusterTopology::from_yaml_str(TOPOLOGY).unwrap();

    assert_eq!(topology.clusters.len(), 2);
    assert_eq!(topology.cluster("primary").unwrap().brokers.len(), 2);
    assert!(matches!(
        topology.cluster("tertiary"),
        Err(AdminError::InvalidConfiguration { .. })
    ));
}

#[test]
fn test_cluster_without_brokers_rejected() {
    let result = ClusterTopology::from_yaml_str("clusters:\n  primary:\n    brokers: []\n");
    assert!(matches!(
        result,
        Err(AdminError::InvalidConfiguration { .. })
    ));
}

#[test]
fn test_broker_with_whitespace_rejected() {
    let result =
        ClusterTopology::from_yaml_str("clusters:\n  primary:\n    brokers: [\"a b:9092\"]\n");
    assert!(result.is_err());
}

#[test]
fn test_malformed_yaml_rejected() {
    let result = ClusterTopology::from_yaml_str("clusters: [not, a, map]");
    assert!(matches!(
        result,
        Err(AdminError::InvalidConfiguration { .. })
    ));
}

#[tokio::test]
async fn test_load_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(TOPOLOGY.as_bytes()).unwrap();

    let topology = ClusterTopology::load(file.path()).await.unwrap();
    assert!(topology.clusters.contains_key("standby"));

    let missing = ClusterTopology::load(Path::new("/nonexistent/hosts.yaml")).await;
    assert!(matches!(
        missing,
        Err(AdminError::InvalidConfiguration { .. })
    ));
}

#[test]
fn test_connect_only_named_clusters() {
    let topology = ClusterTopology::from_yaml_str(TOPOLOGY).unwrap();
    let connections =
        ClusterConnections::connect(&topology, &["standby"], &in_memory_config()).unwrap();

    assert!(connections.client("standby").is_ok());
    assert!(connections.client("primary").is_err());
}

#[test]
fn test_connect_unknown_cluster_fails() {
    let topology = ClusterTopology::from_yaml_str(TOPOLOGY).unwrap();
    let result = ClusterConnections::connect(&topology, &["nowhere"], &in_memory_config());
    assert!(matches!(
        result,
        Err(AdminError::InvalidConfiguration { .. })
    ));
}

#[test]
fn test_connection_pool_size_follows_config() {
    let topology = ClusterTopology::from_yaml_str(TOPOLOGY).unwrap();
    let config = AdminConfig {
        pool_size: 3,
        ..in_memory_config()
    };
    let connections = ClusterConnections::connect(&topology, &["primary"], &config).unwrap();

    assert_eq!(
        connections.client("primary").unwrap().available_connections(),
        3
    );
}
