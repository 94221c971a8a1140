pub mod roster;
pub mod session;
pub mod signaling_client;
pub mod signaling_config;
pub mod signaling_events;
pub mod status_policy;
