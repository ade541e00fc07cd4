//! Floodgate - Fixed-Window Request Throttling
//!
//! This crate implements a request-throttling middleware. Named rules derive a
//! discriminator from each request (caller IP, API key, ...) and count requests
//! per discriminator in epoch-aligned windows. Counters live in a pluggable
//! store: in memory for a single process, or gossiped across a peer mesh.

pub mod config;
pub mod error;
pub mod web;
pub mod mesh;
pub mod throttle;
