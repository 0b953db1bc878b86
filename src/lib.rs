// src/lib.rs

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod runner;
