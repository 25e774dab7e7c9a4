//! Syncio Common - Shared types and utilities
//!
//! This crate provides the types, error definitions, and configuration
//! structures shared by the syncio durable log and target proxy.

pub mod config;
pub mod error;
pub mod types;

pub use config::{CapacityConfig, DispatchConfig, LogConfig, PoolConfig, ProxyConfig};
pub use error::{Error, Result};
pub use types::*;
