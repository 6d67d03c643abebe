#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod cli;
pub mod config;
pub mod disk;
pub mod error;
pub mod guest;
pub mod host;
pub mod identity;
pub mod paths;
pub mod pool;
pub mod power;
pub mod progress;
pub mod transport;
pub mod vmx;
