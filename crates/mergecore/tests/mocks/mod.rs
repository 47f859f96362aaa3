//! In-memory stand-ins for the transport-facing traits.
//!
//! Each mock records what it was asked to do and can be switched into a
//! failing mode, so tests can drive the merge workflow end to end without a
//! Bot API server, ffmpeg or GoFile.

#![allow(dead_code)]

pub mod mock_merger;
pub mod mock_transport;

pub use mock_merger::MockMerger;
pub use mock_transport::{MockChat, MockFiles, MockHost, MockMembership, MockSink};
