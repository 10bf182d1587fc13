//! CLI command implementations

pub mod run;

pub use run::{parse_selector, run, RunOptions};
