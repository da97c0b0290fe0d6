//! VTSource daemon: serves decoded, standardized video frames over TCP.

pub mod cache;
pub mod decode;
pub mod server;
pub mod source;
