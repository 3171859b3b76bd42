//! Test fixtures

pub mod mesh;

pub use mesh::{Mesh, SEED_PORT, SEED_PROBE_PORT, wait_for};
