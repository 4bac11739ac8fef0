//! Fake collaborators and fixtures for exercising the node control core
//! without a real mesh underneath.

pub mod memory;

use std::path::Path;

use lxnode_core::StartOptions;

pub use memory::{
    InterfaceAction, InterfaceCall, MemoryLink, MemoryRouter, MemoryRouterFactory, MemoryTransport,
};

pub fn start_options(dir: &Path, display_name: &str) -> StartOptions {
    let mut options = StartOptions::new(dir);
    options.display_name = display_name.to_string();
    options
}

/// Pre-seed a node directory with a transport config that enables a single
/// AutoInterface, so tests control readiness through one interface name.
pub const DEFAULT_IFACE: &str = "Default Interface";

pub fn write_minimal_rns_config(dir: &Path) {
    let rns_dir = dir.join("rns");
    std::fs::create_dir_all(&rns_dir).expect("create rns dir");
    let config = "\
[reticulum]
    enable_transport = no

[logging]
    loglevel = 4

[interfaces]
    [[Default Interface]]
        type = AutoInterface
        enabled = yes
";
    std::fs::write(rns_dir.join("config"), config).expect("write rns config");
}
