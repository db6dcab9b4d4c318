pub mod api;
pub mod cli;
pub mod cluster;
pub mod error;
pub mod networkdb;
pub mod settings;
pub mod transport;
