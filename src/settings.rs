//! NetworkDB application settings
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::error::Result;

pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const STANDARD_PORT_HTTP: u16 = 7960;
pub const DEFAULT_PORT_HTTP: &str = "7960";
pub const STANDARD_PORT_GOSSIP: u16 = 7946;
pub const DEFAULT_PORT_GOSSIP: &str = "7946";

/// How often the reaper sweeps expired state.
pub const DEFAULT_REAP_PERIOD: Duration = Duration::from_secs(5);
/// Grace period for a deleted entry before it is reaped.
pub const DEFAULT_REAP_ENTRY_INTERVAL: Duration = Duration::from_secs(30 * 60);
/// Grace period for a left or failed node before it is forgotten.
pub const DEFAULT_NODE_REAP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Tunables for the NetworkDB core.
#[derive(Clone, Debug)]
pub struct NetworkDbConfig {
    /// Unique name of the local node in the cluster
    pub node_name: String,
    /// Address other members use to reach the local node
    pub advertise_addr: SocketAddr,
    /// Maximum bytes per gossip packet
    pub packet_buffer_size: usize,
    pub reap_entry_interval: Duration,
    pub reap_network_interval: Duration,
    pub node_reap_interval: Duration,
    pub reap_period: Duration,
    /// Retransmit multiplier for broadcast queues
    pub retransmit_mult: usize,
    /// An unknown delete learned via bulk sync is rebroadcast only while its
    /// residual reap time exceeds `reap_entry_interval / rebroadcast_residual_divisor`
    pub rebroadcast_residual_divisor: u32,
    /// Bulk-sync-sourced rebroadcasts stop once a network's relay queue holds this many
    pub max_queue_len_broadcast_on_sync: usize,
    pub gossip_interval: Duration,
    /// Peers per network that receive each table gossip round
    pub gossip_fanout: usize,
    pub bulk_sync_interval: Duration,
    pub bulk_sync_timeout: Duration,
}

impl NetworkDbConfig {
    pub fn new(node_name: impl Into<String>, advertise_addr: SocketAddr) -> Self {
        Self {
            node_name: node_name.into(),
            advertise_addr,
            ..Self::default()
        }
    }

    /// Network reap interval derived from the entry interval, so entries of a
    /// leaving network are gone before the network record itself.
    pub fn network_reap_interval_for(reap_entry_interval: Duration, reap_period: Duration) -> Duration {
        reap_entry_interval + 5 * reap_period
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_name.is_empty() {
            return Err(crate::config_error!("node name must not be empty"));
        }
        if self.rebroadcast_residual_divisor == 0 {
            return Err(crate::config_error!(
                "rebroadcast residual divisor must be greater than zero"
            ));
        }
        if self.retransmit_mult == 0 {
            return Err(crate::config_error!(
                "retransmit multiplier must be greater than zero"
            ));
        }
        if self.reap_network_interval < self.reap_entry_interval {
            return Err(crate::config_error!(
                "network reap interval ({:?}) must not be shorter than entry reap interval ({:?})",
                self.reap_network_interval,
                self.reap_entry_interval
            ));
        }
        Ok(())
    }
}

impl Default for NetworkDbConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            advertise_addr: SocketAddr::from(([127, 0, 0, 1], STANDARD_PORT_GOSSIP)),
            packet_buffer_size: 1400,
            reap_entry_interval: DEFAULT_REAP_ENTRY_INTERVAL,
            reap_network_interval: Self::network_reap_interval_for(
                DEFAULT_REAP_ENTRY_INTERVAL,
                DEFAULT_REAP_PERIOD,
            ),
            node_reap_interval: DEFAULT_NODE_REAP_INTERVAL,
            reap_period: DEFAULT_REAP_PERIOD,
            retransmit_mult: 4,
            rebroadcast_residual_divisor: 6,
            max_queue_len_broadcast_on_sync: 500,
            gossip_interval: Duration::from_millis(200),
            gossip_fanout: 3,
            bulk_sync_interval: Duration::from_secs(30),
            bulk_sync_timeout: Duration::from_secs(30),
        }
    }
}

/// Settings for the static-topology membership adapter.
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    pub node_name: String,
    /// UDP and TCP listen address for cluster traffic
    pub bind_addr: SocketAddr,
    pub advertise_addr: SocketAddr,
    /// Gossip addresses of the other members
    pub topology: HashSet<SocketAddr>,
    pub packet_buffer_size: usize,
    pub alive_interval: Duration,
    pub gossip_interval: Duration,
    pub gossip_fanout: usize,
    pub push_pull_interval: Duration,
    pub failure_timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct Settings {
    // Name of this node in the cluster
    pub node_name: String,

    // Server listen address
    pub listen_address: String,

    // HTTP API listen port
    pub listen_port: u16,

    // UDP and TCP listen port for cluster traffic
    pub gossip_port: u16,

    // Address advertised to peers (defaults to listen address)
    pub advertise_address: Option<String>,

    // Cluster configuration information: topology
    pub topology: HashSet<SocketAddr>,

    // Gossip Configuration
    pub gossip_interval_ms: u64,
    pub gossip_fanout: usize,
    pub push_pull_interval_secs: u64,
    pub alive_interval_ms: u64,
    pub failure_timeout_secs: u64,

    // Anti-entropy configuration
    pub bulk_sync_interval_secs: u64,
    pub bulk_sync_timeout_secs: u64,

    // Reaping configuration
    pub reap_entry_interval_secs: u64,
    pub reap_period_secs: u64,
    pub node_reap_interval_secs: u64,

    // Rebroadcast policy
    pub retransmit_mult: usize,
    pub rebroadcast_residual_divisor: u32,
    pub max_queue_len_broadcast_on_sync: usize,
    pub packet_buffer_size: usize,
}

impl Settings {
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let ip = self
            .listen_address
            .parse::<IpAddr>()
            .map_err(|e| crate::config_error!("Invalid listen address {}: {}", self.listen_address, e))?;
        Ok(SocketAddr::new(ip, self.gossip_port))
    }

    pub fn advertise_addr(&self) -> Result<SocketAddr> {
        match &self.advertise_address {
            Some(address) => {
                let ip = address
                    .parse::<IpAddr>()
                    .map_err(|e| crate::config_error!("Invalid advertise address {}: {}", address, e))?;
                Ok(SocketAddr::new(ip, self.gossip_port))
            }
            None => self.bind_addr(),
        }
    }

    pub fn http_addr(&self) -> Result<SocketAddr> {
        let ip = self
            .listen_address
            .parse::<IpAddr>()
            .map_err(|e| crate::config_error!("Invalid listen address {}: {}", self.listen_address, e))?;
        Ok(SocketAddr::new(ip, self.listen_port))
    }

    /// Node name, falling back to the advertised gossip address.
    pub fn node_name(&self) -> Result<String> {
        if self.node_name.is_empty() {
            Ok(self.advertise_addr()?.to_string())
        } else {
            Ok(self.node_name.clone())
        }
    }

    pub fn networkdb_config(&self) -> Result<NetworkDbConfig> {
        let reap_entry_interval = Duration::from_secs(self.reap_entry_interval_secs);
        let reap_period = Duration::from_secs(self.reap_period_secs);
        let config = NetworkDbConfig {
            node_name: self.node_name()?,
            advertise_addr: self.advertise_addr()?,
            packet_buffer_size: self.packet_buffer_size,
            reap_entry_interval,
            reap_network_interval: NetworkDbConfig::network_reap_interval_for(
                reap_entry_interval,
                reap_period,
            ),
            node_reap_interval: Duration::from_secs(self.node_reap_interval_secs),
            reap_period,
            retransmit_mult: self.retransmit_mult,
            rebroadcast_residual_divisor: self.rebroadcast_residual_divisor,
            max_queue_len_broadcast_on_sync: self.max_queue_len_broadcast_on_sync,
            gossip_interval: Duration::from_millis(self.gossip_interval_ms),
            gossip_fanout: self.gossip_fanout,
            bulk_sync_interval: Duration::from_secs(self.bulk_sync_interval_secs),
            bulk_sync_timeout: Duration::from_secs(self.bulk_sync_timeout_secs),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn cluster_config(&self) -> Result<ClusterConfig> {
        let advertise_addr = self.advertise_addr()?;
        Ok(ClusterConfig {
            node_name: self.node_name()?,
            bind_addr: self.bind_addr()?,
            advertise_addr,
            topology: self
                .topology
                .iter()
                .copied()
                .filter(|addr| *addr != advertise_addr)
                .collect(),
            packet_buffer_size: self.packet_buffer_size,
            alive_interval: Duration::from_millis(self.alive_interval_ms),
            gossip_interval: Duration::from_millis(self.gossip_interval_ms),
            gossip_fanout: self.gossip_fanout,
            push_pull_interval: Duration::from_secs(self.push_pull_interval_secs),
            failure_timeout: Duration::from_secs(self.failure_timeout_secs),
        })
    }
}
