//! Local change notifications
use tokio::sync::mpsc;

/// Pseudo table carrying cluster membership changes.
pub const NODE_TABLE: &str = "NodeTable";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchEventKind {
    Create,
    Update,
    Delete,
}

/// A change to one entry as seen by the local node.
///
/// Creates carry only `value`, deletes only `prev`, updates both.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchEvent {
    pub table: String,
    pub network_id: String,
    pub key: String,
    pub value: Option<Vec<u8>>,
    pub prev: Option<Vec<u8>>,
}

impl WatchEvent {
    pub fn create(table: &str, network_id: &str, key: &str, value: Vec<u8>) -> Self {
        Self {
            table: table.to_string(),
            network_id: network_id.to_string(),
            key: key.to_string(),
            value: Some(value),
            prev: None,
        }
    }

    pub fn update(table: &str, network_id: &str, key: &str, value: Vec<u8>, prev: Vec<u8>) -> Self {
        Self {
            table: table.to_string(),
            network_id: network_id.to_string(),
            key: key.to_string(),
            value: Some(value),
            prev: Some(prev),
        }
    }

    pub fn delete(table: &str, network_id: &str, key: &str, prev: Vec<u8>) -> Self {
        Self {
            table: table.to_string(),
            network_id: network_id.to_string(),
            key: key.to_string(),
            value: None,
            prev: Some(prev),
        }
    }

    pub fn kind(&self) -> WatchEventKind {
        match (&self.value, &self.prev) {
            (Some(_), Some(_)) => WatchEventKind::Update,
            (Some(_), None) => WatchEventKind::Create,
            (None, _) => WatchEventKind::Delete,
        }
    }
}

pub type WatchReceiver = mpsc::UnboundedReceiver<WatchEvent>;

/// One subscription. `None` filters match everything.
#[derive(Debug)]
pub(crate) struct Watcher {
    pub(crate) table: Option<String>,
    pub(crate) network_id: Option<String>,
    pub(crate) tx: mpsc::UnboundedSender<WatchEvent>,
}

impl Watcher {
    pub(crate) fn new(table: &str, network_id: &str) -> (Self, WatchReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = Self {
            table: (!table.is_empty()).then(|| table.to_string()),
            network_id: (!network_id.is_empty()).then(|| network_id.to_string()),
            tx,
        };
        (watcher, rx)
    }

    pub(crate) fn matches(&self, table: &str, network_id: &str) -> bool {
        self.table.as_deref().is_none_or(|t| t == table)
            && self.network_id.as_deref().is_none_or(|n| n == network_id)
    }
}

/// Deliver an event to every matching watcher, dropping closed subscriptions.
pub(crate) fn publish(watchers: &mut Vec<Watcher>, event: WatchEvent) {
    watchers.retain(|watcher| {
        if !watcher.matches(&event.table, &event.network_id) {
            return !watcher.tx.is_closed();
        }
        watcher.tx.send(event.clone()).is_ok()
    });
}
