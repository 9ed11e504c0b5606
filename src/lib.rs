// ABOUTME: Library root for kiln - exposes the engine, model and collaborators for testing.
// ABOUTME: The main binary is in main.rs.

pub mod buildcontrol;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod output;
pub mod runtime;
pub mod store;
pub mod types;
