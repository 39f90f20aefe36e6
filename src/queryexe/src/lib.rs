#[macro_use]
extern crate log;

pub mod codec;
pub mod cost;
pub mod io;
pub mod opiterator;
pub mod protocol;
pub mod query;

pub use io::{ExecEnv, IoManager};
pub use opiterator::{OpIterator, Operator};
