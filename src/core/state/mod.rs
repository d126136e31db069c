// src/core/state/mod.rs

//! Defines the central `ServerState` struct tying together every component
//! (spec §4.A-I). Kept as a single module, unlike the teacher's multi-file
//! split, since clustermux's state has no sub-state large enough to warrant
//! its own file (no persistence/replication/cache/stats equivalents).

mod core;

pub use core::{ServerInit, ServerState};
