#[macro_use]
extern crate log;

pub mod planner;
pub mod stats;

pub use planner::Planner;
pub use stats::StatsCatalog;
