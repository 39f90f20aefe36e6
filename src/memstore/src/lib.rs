#[macro_use]
extern crate log;

pub mod storage_manager;
