//! Message codec for the host bridge.
//!
//! On dual-core gateways the network core runs the MAC and forwards traffic
//! and membership changes to the application core over an HDLC-framed UART
//! link. Single-core deployments never enable this module.
//!
//! Each message is one HDLC frame: a type byte followed by little-endian
//! fields. `GatewayInfo` is emitted once per slotframe.

use mari_encoding::packet_length::PACKET_MAX_SIZE;

use crate::association::DisconnectReason;

pub mod hdlc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Error {
    BufferTooShort,
    Truncated,
    UnknownMessageType,
    UnknownReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
#[repr(u8)]
pub enum MessageType {
    NodeJoined = 1,
    NodeLeft = 2,
    Data = 3,
    Keepalive = 4,
    GatewayInfo = 5,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self, Error> {
        match v {
            1 => Ok(MessageType::NodeJoined),
            2 => Ok(MessageType::NodeLeft),
            3 => Ok(MessageType::Data),
            4 => Ok(MessageType::Keepalive),
            5 => Ok(MessageType::GatewayInfo),
            _ => Err(Error::UnknownMessageType),
        }
    }
}

fn reason_code(reason: DisconnectReason) -> u8 {
    match reason {
        DisconnectReason::Handover => 1,
        DisconnectReason::OutOfSync => 2,
        DisconnectReason::GatewayFull => 3,
        DisconnectReason::PeerLostTimeout => 4,
        DisconnectReason::PeerLostBloom => 5,
        DisconnectReason::HandoverFailed => 6,
    }
}

fn reason_from_code(code: u8) -> Result<DisconnectReason, Error> {
    match code {
        1 => Ok(DisconnectReason::Handover),
        2 => Ok(DisconnectReason::OutOfSync),
        3 => Ok(DisconnectReason::GatewayFull),
        4 => Ok(DisconnectReason::PeerLostTimeout),
        5 => Ok(DisconnectReason::PeerLostBloom),
        6 => Ok(DisconnectReason::HandoverFailed),
        _ => Err(Error::UnknownReason),
    }
}

/// The periodic gateway status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayInfo {
    pub device_id: u64,
    pub network_id: u16,
    pub schedule_id: u16,
    pub sched_usage: [u8; 32],
    pub asn: u64,
    pub timer: u32,
}

pub const GATEWAY_INFO_LEN: usize = 1 + 8 + 2 + 2 + 32 + 8 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeMessage<'a> {
    NodeJoined { node_id: u64 },
    NodeLeft { node_id: u64, reason: DisconnectReason },
    Data { src: u64, payload: &'a [u8] },
    Keepalive { node_id: u64 },
    GatewayInfo(GatewayInfo),
}

struct Writer<'a> {
    out: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn put(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let end = self.pos + bytes.len();
        self.out.get_mut(self.pos..end).ok_or(Error::BufferTooShort)?.copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }
}

fn read_u64(bytes: &[u8], off: usize) -> Result<u64, Error> {
    let raw: [u8; 8] =
        bytes.get(off..off + 8).ok_or(Error::Truncated)?.try_into().map_err(|_| Error::Truncated)?;
    Ok(u64::from_le_bytes(raw))
}

impl<'a> BridgeMessage<'a> {
    pub fn message_type(&self) -> MessageType {
        match self {
            BridgeMessage::NodeJoined { .. } => MessageType::NodeJoined,
            BridgeMessage::NodeLeft { .. } => MessageType::NodeLeft,
            BridgeMessage::Data { .. } => MessageType::Data,
            BridgeMessage::Keepalive { .. } => MessageType::Keepalive,
            BridgeMessage::GatewayInfo(_) => MessageType::GatewayInfo,
        }
    }

    /// Serialises the message into `out`, returning the length.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, Error> {
        let mut w = Writer { out, pos: 0 };
        w.put(&[self.message_type() as u8])?;
        match self {
            BridgeMessage::NodeJoined { node_id } | BridgeMessage::Keepalive { node_id } => {
                w.put(&node_id.to_le_bytes())?;
            }
            BridgeMessage::NodeLeft { node_id, reason } => {
                w.put(&node_id.to_le_bytes())?;
                w.put(&[reason_code(*reason)])?;
            }
            BridgeMessage::Data { src, payload } => {
                w.put(&src.to_le_bytes())?;
                w.put(payload)?;
            }
            BridgeMessage::GatewayInfo(info) => {
                w.put(&info.device_id.to_le_bytes())?;
                w.put(&info.network_id.to_le_bytes())?;
                w.put(&info.schedule_id.to_le_bytes())?;
                w.put(&info.sched_usage)?;
                w.put(&info.asn.to_le_bytes())?;
                w.put(&info.timer.to_le_bytes())?;
            }
        }
        Ok(w.pos)
    }

    /// Serialises straight into an HDLC frame ready for the UART.
    pub fn encode_hdlc(&self, out: &mut [u8]) -> Result<usize, Error> {
        let mut raw = [0u8; 9 + PACKET_MAX_SIZE];
        let len = self.encode(&mut raw)?;
        hdlc::encode(&raw[..len], out).ok_or(Error::BufferTooShort)
    }

    pub fn parse(bytes: &'a [u8]) -> Result<Self, Error> {
        let message_type = MessageType::try_from(*bytes.first().ok_or(Error::Truncated)?)?;
        match message_type {
            MessageType::NodeJoined => Ok(BridgeMessage::NodeJoined { node_id: read_u64(bytes, 1)? }),
            MessageType::Keepalive => Ok(BridgeMessage::Keepalive { node_id: read_u64(bytes, 1)? }),
            MessageType::NodeLeft => {
                let node_id = read_u64(bytes, 1)?;
                let code = *bytes.get(9).ok_or(Error::Truncated)?;
                Ok(BridgeMessage::NodeLeft { node_id, reason: reason_from_code(code)? })
            }
            MessageType::Data => {
                let src = read_u64(bytes, 1)?;
                Ok(BridgeMessage::Data { src, payload: &bytes[9..] })
            }
            MessageType::GatewayInfo => {
                if bytes.len() < GATEWAY_INFO_LEN {
                    return Err(Error::Truncated);
                }
                let mut sched_usage = [0u8; 32];
                sched_usage.copy_from_slice(&bytes[13..45]);
                Ok(BridgeMessage::GatewayInfo(GatewayInfo {
                    device_id: read_u64(bytes, 1)?,
                    network_id: u16::from_le_bytes([bytes[9], bytes[10]]),
                    schedule_id: u16::from_le_bytes([bytes[11], bytes[12]]),
                    sched_usage,
                    asn: read_u64(bytes, 45)?,
                    timer: u32::from_le_bytes([bytes[53], bytes[54], bytes[55], bytes[56]]),
                }))
            }
        }
    }
}
