// src/lib.rs
pub mod cli;
pub mod config;
pub mod datatypes;
pub mod pipelines;
pub mod utils;
pub use cli::Arguments;
