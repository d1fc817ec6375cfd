// Logging infrastructure shared by the stratus crates
pub mod timing;
#[macro_use]
pub mod logging;
pub mod log;

extern crate anyhow;
pub use anyhow::{anyhow, Context, Error, Result};
