//! Streaming Feed Adapters
//!
//! Transport and framing for the persistent streaming connection.
//! Reconnects, backoff and state tracking live in the stream handler;
//! these adapters only move and decode frames.

pub mod json_frames;
pub mod ws_connector;

pub use json_frames::JsonFrameDecoder;
pub use ws_connector::WsConnector;
