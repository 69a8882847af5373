//! Sizeforge - compress uploaded videos to a requested file size
//!
//! This library crate exposes the service for integration testing.

pub mod config;
pub mod jobs;
pub mod orchestrator;
pub mod server;
