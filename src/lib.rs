//! Signaling server brokering WebRTC negotiation between a stream host and its viewers

pub mod config;
pub mod signaling;
