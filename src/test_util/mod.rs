//! This module contains utilities that are useful for testing code based on the signaling client:
//!  a fake signaling server speaking the wire protocol on a real socket, and an observer that
//!  records events for assertions. They are used for testing the client itself, but they are also
//!  exported for application testing, which is why they are part of the crate's regular
//!  (non-#[cfg(test)]) code.

pub mod fake_server;
pub mod observer;
