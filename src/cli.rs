//! CLI for this application
//!
use std::net::SocketAddr;

use crate::settings;

#[derive(Clone, Debug, clap::Parser)]
#[command(name = settings::APP_NAME, version = settings::APP_VERSION)]
pub struct Cli {
    // Node name in the cluster
    #[clap(
        long,
        default_value = "",
        env("NETWORKDB_NODE_NAME"),
        help = "Unique node name (defaults to the advertised gossip address)"
    )]
    pub node_name: String,

    // Server listen address
    #[clap(
        long,
        default_value = "0.0.0.0",
        env("NETWORKDB_LISTEN_ADDRESS"),
        help = "IP Address to listen on"
    )]
    pub listen_address: String,

    // HTTP API listen port
    #[clap(
        long,
        default_value = settings::DEFAULT_PORT_HTTP,
        env("NETWORKDB_HTTP_LISTEN_PORT"),
        help = "Port to bind NetworkDB HTTP API server to"
    )]
    pub listen_port: u16,

    // UDP and TCP listen port for cluster traffic
    #[clap(
        long,
        default_value = settings::DEFAULT_PORT_GOSSIP,
        env("NETWORKDB_GOSSIP_LISTEN_PORT"),
        help = "Port to bind NetworkDB UDP and TCP cluster listeners to"
    )]
    pub gossip_port: u16,

    // Advertised address
    #[clap(
        long,
        env("NETWORKDB_ADVERTISE_ADDRESS"),
        help = "IP Address advertised to peers (defaults to listen address)"
    )]
    pub advertise_address: Option<String>,

    // Cluster configuration information: topology
    #[clap(
        long,
        env("NETWORKDB_TOPOLOGY"),
        value_delimiter = ',',
        help = "Gossip addresses of cluster members (e.g., 10.0.0.1:7946,10.0.0.2:7946). If empty, runs alone."
    )]
    pub topology: Vec<SocketAddr>,

    #[clap(
        long,
        default_value = "200",
        env("NETWORKDB_GOSSIP_INTERVAL_MS"),
        help = "Milliseconds between gossip rounds"
    )]
    pub gossip_interval_ms: u64,

    #[clap(
        long,
        default_value = "3",
        env("NETWORKDB_GOSSIP_FANOUT"),
        help = "Peers contacted per gossip round"
    )]
    pub gossip_fanout: usize,

    #[clap(
        long,
        default_value = "30",
        env("NETWORKDB_PUSH_PULL_INTERVAL_SECONDS"),
        help = "Seconds between full state exchanges with a random peer"
    )]
    pub push_pull_interval_secs: u64,

    #[clap(
        long,
        default_value = "1000",
        env("NETWORKDB_ALIVE_INTERVAL_MS"),
        help = "Milliseconds between heartbeats"
    )]
    pub alive_interval_ms: u64,

    #[clap(
        long,
        default_value = "10",
        env("NETWORKDB_FAILURE_TIMEOUT_SECONDS"),
        help = "Seconds of silence before a peer is considered failed"
    )]
    pub failure_timeout_secs: u64,

    #[clap(
        long,
        default_value = "30",
        env("NETWORKDB_BULK_SYNC_INTERVAL_SECONDS"),
        help = "Seconds between periodic bulk syncs"
    )]
    pub bulk_sync_interval_secs: u64,

    #[clap(
        long,
        default_value = "30",
        env("NETWORKDB_BULK_SYNC_TIMEOUT_SECONDS"),
        help = "Seconds to wait for a bulk sync reply"
    )]
    pub bulk_sync_timeout_secs: u64,

    #[clap(
        long,
        default_value = "1800",
        env("NETWORKDB_REAP_ENTRY_INTERVAL_SECONDS"),
        help = "Seconds a deleted entry is kept before it is reaped"
    )]
    pub reap_entry_interval_secs: u64,

    #[clap(
        long,
        default_value = "5",
        env("NETWORKDB_REAP_PERIOD_SECONDS"),
        help = "Seconds between reaper sweeps"
    )]
    pub reap_period_secs: u64,

    #[clap(
        long,
        default_value = "86400",
        env("NETWORKDB_NODE_REAP_INTERVAL_SECONDS"),
        help = "Seconds a left or failed node is remembered"
    )]
    pub node_reap_interval_secs: u64,

    #[clap(
        long,
        default_value = "4",
        env("NETWORKDB_RETRANSMIT_MULT"),
        help = "Retransmit multiplier for broadcast queues"
    )]
    pub retransmit_mult: usize,

    #[clap(
        long,
        default_value = "6",
        env("NETWORKDB_REBROADCAST_RESIDUAL_DIVISOR"),
        help = "Rebroadcast an unknown delete only while residual reap time exceeds the entry reap interval over this divisor"
    )]
    pub rebroadcast_residual_divisor: u32,

    #[clap(
        long,
        default_value = "500",
        env("NETWORKDB_MAX_QUEUE_LEN_BROADCAST_ON_SYNC"),
        help = "Skip relaying bulk-synced events when the queue is longer than this"
    )]
    pub max_queue_len_broadcast_on_sync: usize,

    #[clap(
        long,
        default_value = "1400",
        env("NETWORKDB_PACKET_BUFFER_SIZE"),
        help = "Maximum gossip packet size in bytes"
    )]
    pub packet_buffer_size: usize,
}

impl Cli {
    pub fn into_settings(self) -> settings::Settings {
        settings::Settings {
            node_name: self.node_name,
            listen_address: self.listen_address,
            listen_port: self.listen_port,
            gossip_port: self.gossip_port,
            advertise_address: self.advertise_address,
            topology: self.topology.into_iter().collect(),
            gossip_interval_ms: self.gossip_interval_ms,
            gossip_fanout: self.gossip_fanout,
            push_pull_interval_secs: self.push_pull_interval_secs,
            alive_interval_ms: self.alive_interval_ms,
            failure_timeout_secs: self.failure_timeout_secs,
            bulk_sync_interval_secs: self.bulk_sync_interval_secs,
            bulk_sync_timeout_secs: self.bulk_sync_timeout_secs,
            reap_entry_interval_secs: self.reap_entry_interval_secs,
            reap_period_secs: self.reap_period_secs,
            node_reap_interval_secs: self.node_reap_interval_secs,
            retransmit_mult: self.retransmit_mult,
            rebroadcast_residual_divisor: self.rebroadcast_residual_divisor,
            max_queue_len_broadcast_on_sync: self.max_queue_len_broadcast_on_sync,
            packet_buffer_size: self.packet_buffer_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn test_defaults_match_core_defaults() {
        let cli = Cli::try_parse_from(["networkdb"]).unwrap();
        let settings = cli.into_settings();
        let config = settings.networkdb_config().unwrap();
        let defaults = crate::settings::NetworkDbConfig::default();
        assert_eq!(config.reap_entry_interval, defaults.reap_entry_interval);
        assert_eq!(config.reap_network_interval, defaults.reap_network_interval);
        assert_eq!(config.gossip_interval, defaults.gossip_interval);
        assert_eq!(config.bulk_sync_timeout, defaults.bulk_sync_timeout);
        assert_eq!(config.packet_buffer_size, defaults.packet_buffer_size);
    }

    #[test]
    fn test_topology_list() {
        let cli = Cli::try_parse_from([
            "networkdb",
            "--node-name",
            "node-a",
            "--topology",
            "10.0.0.1:7946,10.0.0.2:7946",
        ])
        .unwrap();
        let settings = cli.into_settings();
        assert_eq!(settings.node_name, "node-a");
        assert_eq!(settings.topology.len(), 2);
    }
}
