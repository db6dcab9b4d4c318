//! All Paths are recorded here for use throughout this codebase
pub mod base {
    pub const ROOT: &str = "/";
    pub const HEALTH: &str = "/health";
    pub const ABOUT: &str = "/about";
}

pub const PEERS: &str = "/peers";

pub mod networks {
    pub const NETWORK: &str = "/networks/{network_id}";
    pub const PEERS: &str = "/networks/{network_id}/peers";
    pub const TABLE: &str = "/networks/{network_id}/tables/{table}";
    pub const ENTRY: &str = "/networks/{network_id}/tables/{table}/{key}";
}

pub fn network_path(network_id: &str) -> String {
    networks::NETWORK.replace("{network_id}", network_id)
}

pub fn entry_path(network_id: &str, table: &str, key: &str) -> String {
    networks::ENTRY
        .replace("{network_id}", network_id)
        .replace("{table}", table)
        .replace("{key}", key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_builders() {
        assert_eq!(network_path("net1"), "/networks/net1");
        assert_eq!(
            entry_path("net1", "endpoint_table", "ep1"),
            "/networks/net1/tables/endpoint_table/ep1"
        );
    }
}
