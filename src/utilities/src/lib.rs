#[macro_use]
extern crate log;

pub mod cluster;
pub mod datagen;

pub use cluster::LocalCluster;
pub use datagen::TableTemplate;
