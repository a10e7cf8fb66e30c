#![no_std]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Crate mari-encoding provides structures and tools for reading and writing
//! Mari protocol frames from and to a slice of bytes.
//!
//! Mari frames are fixed little-endian layouts: a 24-byte common header
//! (data, join request, join response, keepalive) or the alternative
//! 24-byte beacon header followed by a 128-byte bloom filter. Parsing is
//! zero-copy ([`parser`]); building writes into caller-provided buffers
//! ([`creator`]).

pub mod creator;
pub mod packet_length;
pub mod parser;

/// Version stamped into (and required of) every frame.
pub const PROTOCOL_VERSION: u8 = 2;

/// The all-ones broadcast device id.
pub const BROADCAST_ID: u64 = 0xFFFF_FFFF_FFFF_FFFF;
