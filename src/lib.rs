//! Watch room synchronization engine.
//!
//! Several clients share a room (movie pool, watched set, filters, a broadcast
//! "tonight's pick", a "play together" command and a chat log) replicated
//! through a snapshot-listener document store with no server-side logic.
//! [`services::session::RoomSession`] is the entry point; it wires the
//! presence tracker, state replicator, pick coordinator, playback sync and
//! message stream against one room identifier.

pub mod config;
pub mod dao;
pub mod dto;
pub mod error;
pub mod routes;
pub mod services;
pub mod state;
