//! Cluster node configuration
//!
//! Sources, lowest priority first: defaults, an optional TOML file, then
//! environment variables.
//!
//! ```toml
//! topic = "storage-data"
//! node_name = "node-0"
//! state_dir = "/storage"
//! mode = "async"
//!
//! [kafka]
//! bootstrap_servers = "kafka:9092"
//! ```

use crate::replication::{DEFAULT_ORDERING_KEY, DistributionMode, PacketCodec, packet::MAX_PACKET_SIZE};
use crate::{Error, Result};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// What to do when a local store call fails on the write path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreFailurePolicy {
    /// Log and terminate the process
    Exit,
    /// Return the error to the caller
    #[default]
    Propagate,
}

/// Kafka client settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    /// Comma-separated broker list
    pub bootstrap_servers: String,
    /// `security.protocol`, e.g. `SASL_SSL`
    pub security_protocol: Option<String>,
    /// `sasl.mechanism`, e.g. `PLAIN`
    pub sasl_mechanism: Option<String>,
    /// SASL user name
    pub username: Option<String>,
    /// SASL password
    pub password: Option<String>,
    /// Additional client properties passed through unchanged
    pub properties: BTreeMap<String, String>,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            security_protocol: None,
            sasl_mechanism: None,
            username: None,
            password: None,
            properties: BTreeMap::new(),
        }
    }
}

/// Configuration of one cluster node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Replication topic
    pub topic: String,
    /// Name of this node, part of the consumer group id
    pub node_name: String,
    /// Directory holding the offset file and the stopped marker
    pub state_dir: PathBuf,
    /// Distributor execution mode
    pub mode: DistributionMode,
    /// Maximum payload bytes per packet
    pub max_packet_size: usize,
    /// Ordering key of every replication record
    pub ordering_key: String,
    /// Maximum wait of one poll round, in milliseconds
    pub poll_timeout_ms: u64,
    /// Promotion gives up after this many milliseconds
    pub promotion_timeout_ms: u64,
    /// Readiness check interval during promotion, in milliseconds
    pub promotion_poll_interval_ms: u64,
    /// Producer flush timeout, in milliseconds
    pub flush_timeout_ms: u64,
    /// Persist the applied offset to the offset file
    pub persist_offsets: bool,
    /// Reaction to local store failures on the write path
    pub store_failure_policy: StoreFailurePolicy,
    /// Kafka client settings
    pub kafka: KafkaConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            topic: "storage-data".to_string(),
            node_name: "node-0".to_string(),
            state_dir: PathBuf::from("./storage"),
            mode: DistributionMode::Sync,
            max_packet_size: MAX_PACKET_SIZE,
            ordering_key: DEFAULT_ORDERING_KEY.to_string(),
            poll_timeout_ms: 5_000,
            promotion_timeout_ms: 120_000,
            promotion_poll_interval_ms: 1_000,
            flush_timeout_ms: 30_000,
            persist_offsets: true,
            store_failure_policy: StoreFailurePolicy::Propagate,
            kafka: KafkaConfig::default(),
        }
    }
}

impl ClusterConfig {
    /// Load a TOML file on top of the defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str(&content)
            .map_err(|e| Error::config(format!("Failed to parse {}: {}", path.display(), e)))?;
        tracing::info!("Loaded cluster configuration from {}", path.display());
        Ok(config)
    }

    /// Load from the process environment; `GRIDREP_CONFIG` names an optional TOML file
    pub fn from_env() -> Result<Self> {
        let lookup = |key: &str| std::env::var(key).ok();
        let path = lookup("GRIDREP_CONFIG").map(PathBuf::from);
        Self::load(path.as_deref(), lookup)
    }

    /// Defaults, then `path`, then overrides from `lookup`, then validation
    pub fn load(path: Option<&Path>, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment-style overrides
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(topic) = lookup("GRIDREP_TOPIC") {
            self.topic = topic;
        }
        if let Some(node_name) = lookup("GRIDREP_NODE_NAME") {
            self.node_name = node_name;
        }
        if let Some(state_dir) = lookup("GRIDREP_STATE_DIR") {
            self.state_dir = PathBuf::from(state_dir);
        }
        if let Some(mode) = lookup("GRIDREP_DISTRIBUTION_MODE") {
            self.mode = match mode.to_ascii_lowercase().as_str() {
                "sync" => DistributionMode::Sync,
                "async" => DistributionMode::Async,
                other => {
                    return Err(Error::config(format!("Invalid GRIDREP_DISTRIBUTION_MODE: {}", other)));
                }
            };
        }
        if let Some(policy) = lookup("GRIDREP_STORE_FAILURE_POLICY") {
            self.store_failure_policy = match policy.to_ascii_lowercase().as_str() {
                "exit" => StoreFailurePolicy::Exit,
                "propagate" => StoreFailurePolicy::Propagate,
                other => {
                    return Err(Error::config(format!(
                        "Invalid GRIDREP_STORE_FAILURE_POLICY: {}",
                        other
                    )));
                }
            };
        }
        override_parsed(&lookup, "GRIDREP_MAX_PACKET_SIZE", &mut self.max_packet_size)?;
        override_parsed(&lookup, "GRIDREP_POLL_TIMEOUT_MS", &mut self.poll_timeout_ms)?;
        override_parsed(&lookup, "GRIDREP_PROMOTION_TIMEOUT_MS", &mut self.promotion_timeout_ms)?;
        override_parsed(&lookup, "GRIDREP_PERSIST_OFFSETS", &mut self.persist_offsets)?;

        if let Some(servers) = lookup("KAFKA_BOOTSTRAP_SERVERS") {
            self.kafka.bootstrap_servers = servers;
        }
        if let Some(protocol) = lookup("KAFKA_SECURITY_PROTOCOL") {
            self.kafka.security_protocol = Some(protocol);
        }
        if let Some(mechanism) = lookup("KAFKA_SASL_MECHANISM") {
            self.kafka.sasl_mechanism = Some(mechanism);
        }
        if let Some(username) = lookup("KAFKA_USERNAME") {
            self.kafka.username = Some(username);
        }
        if let Some(password) = lookup("KAFKA_PASSWORD") {
            self.kafka.password = Some(password);
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.topic.trim().is_empty() {
            return Err(Error::config("topic must not be empty"));
        }
        if self.node_name.trim().is_empty() {
            return Err(Error::config("node_name must not be empty"));
        }
        if self.ordering_key.is_empty() {
            return Err(Error::config("ordering_key must not be empty"));
        }
        PacketCodec::new(self.max_packet_size)?;
        if self.poll_timeout_ms == 0 {
            return Err(Error::config("poll_timeout_ms must be at least 1"));
        }
        if self.promotion_poll_interval_ms == 0 {
            return Err(Error::config("promotion_poll_interval_ms must be at least 1"));
        }
        if self.kafka.bootstrap_servers.trim().is_empty() {
            return Err(Error::config("kafka.bootstrap_servers must not be empty"));
        }
        Ok(())
    }

    /// Fresh consumer group id: `<topic>-<node>-<8 random alphanumerics>`
    pub fn group_id(&self) -> String {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        format!("{}-{}-{}", self.topic, self.node_name, suffix)
    }

    /// Packet codec for the configured packet size
    pub fn codec(&self) -> Result<PacketCodec> {
        PacketCodec::new(self.max_packet_size)
    }

    /// Poll timeout
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Promotion deadline
    pub fn promotion_timeout(&self) -> Duration {
        Duration::from_millis(self.promotion_timeout_ms)
    }

    /// Promotion readiness check interval
    pub fn promotion_poll_interval(&self) -> Duration {
        Duration::from_millis(self.promotion_poll_interval_ms)
    }

    /// Producer flush timeout
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    /// Set the topic
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Set the node name
    pub fn with_node_name(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = node_name.into();
        self
    }

    /// Set the state directory
    pub fn with_state_dir(mut self, state_dir: impl Into<PathBuf>) -> Self {
        self.state_dir = state_dir.into();
        self
    }

    /// Set the distribution mode
    pub fn with_mode(mut self, mode: DistributionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the maximum packet size
    pub fn with_max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }

    /// Set the poll timeout
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the promotion deadline and check interval
    pub fn with_promotion_timeout(mut self, timeout: Duration, interval: Duration) -> Self {
        self.promotion_timeout_ms = timeout.as_millis() as u64;
        self.promotion_poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the store failure policy
    pub fn with_store_failure_policy(mut self, policy: StoreFailurePolicy) -> Self {
        self.store_failure_policy = policy;
        self
    }
}

fn override_parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) -> Result<()>
where
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| Error::config(format!("Invalid {}: {:?} ({})", key, raw, e)))?;
    }
    Ok(())
}
