// packages/engine/src/packet/mod.rs
//! Packet primitives
//!
//! Bounded buffer access, header views, incremental checksum arithmetic and a
//! frame builder used by replay and tests.

pub mod buffer;
pub mod builder;
pub mod checksum;
pub mod headers;

pub use buffer::{CsumFlags, FieldChange, PacketBuf, PacketError};
pub use builder::{checksums_valid, FrameBuilder, Transport};
pub use headers::{HeaderError, Ipv4View, TcpFlags, TcpView, UdpView};
