/// Render boundary: room event hub.
pub mod events;
/// Health reporting for the bridge.
pub mod health_service;
/// Room chat log.
pub mod messages;
/// Tonight's pick selection and open-once delivery.
pub mod pick;
/// "Play together" broadcast.
pub mod playback;
/// Presence heartbeat and member roster.
pub mod presence;
/// Pool, watched set and filter replication.
pub mod replicator;
/// Room lifecycle orchestration.
pub mod session;
/// Server-Sent Events forwarding of room events.
pub mod sse_service;
/// Store health polling and degraded mode.
pub mod storage_monitor;
