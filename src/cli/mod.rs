//! `rmbg` command-line driver
//!
//! Only available with the `cli` feature.

#[path = "main.rs"]
mod main_impl;

pub use main_impl::{main, Cli};
