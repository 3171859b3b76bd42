//! Shared fixtures for driftmesh integration tests.

pub mod fixtures;
