#![cfg_attr(not(test), no_std)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! ## Feature flags
#![doc = document_features::document_features!(feature_label = r#"<span class="stab portability"><code>{feature}</code></span>"#)]
#![doc = include_str!("../README.md")]

mod fmt;

pub mod association;
pub mod bloom;
pub mod constants;
pub mod queue;
pub mod radio;
pub mod scan;
pub mod scheduler;
pub mod timer;

pub mod persist;

#[cfg(feature = "host-bridge")]
#[cfg_attr(docsrs, doc(cfg(feature = "host-bridge")))]
pub mod bridge;

mod device;
mod mac;

pub use association::{AssociationState, DisconnectReason};
pub use device::{Config, Error, Event, Mari, ReceivedPacket};
pub use mari_encoding::{BROADCAST_ID, PROTOCOL_VERSION};
pub use rand_core::RngCore;
pub use timer::Alarm;

#[cfg(test)]
mod test_util;

/// Whether this device coordinates the network or leafs into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Role {
    Gateway,
    Node,
}
