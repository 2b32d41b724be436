//! Datagram framing
//!
//! Every datagram starts with one signed discriminant byte followed by the
//! fields of that packet kind. Integers are fixed-width big-endian, strings
//! are a 32-bit big-endian byte count followed by UTF-8. Anything that cannot be decoded is
//! dropped: [`Packet::decode`] returns `None` and never panics.

use crate::error::NetError;
use crate::MAX_PACKET_SIZE;
use bincode::Options;

/// Message kinds, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum PacketType {
    Disconnect = -1,
    Connect = 0,
    Heartbeat = 1,
    Snapshot = 2,
    PlayerUpdate = 3,
    Message = 4,
    Hurt = 5,
}

impl PacketType {
    /// First discriminant past the valid range.
    pub const OUT_OF_BOUND: i8 = 6;

    pub fn id(self) -> i8 {
        self as i8
    }

    /// Kinds that keep their discriminant but have no payload contract yet.
    pub fn is_reserved(self) -> bool {
        matches!(
            self,
            PacketType::Snapshot | PacketType::PlayerUpdate | PacketType::Hurt
        )
    }
}

impl TryFrom<i8> for PacketType {
    type Error = i8;

    fn try_from(id: i8) -> Result<Self, Self::Error> {
        match id {
            -1 => Ok(PacketType::Disconnect),
            0 => Ok(PacketType::Connect),
            1 => Ok(PacketType::Heartbeat),
            2 => Ok(PacketType::Snapshot),
            3 => Ok(PacketType::PlayerUpdate),
            4 => Ok(PacketType::Message),
            5 => Ok(PacketType::Hurt),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Disconnect,
    Connect {
        player_name: String,
    },
    /// Probe from the server carrying its virtual time; clients echo it back.
    Heartbeat {
        timestamp: i32,
    },
    Message {
        text: String,
    },
    /// Snapshot, PlayerUpdate or Hurt, passed through as raw bytes.
    Reserved {
        kind: PacketType,
        payload: Vec<u8>,
    },
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit((MAX_PACKET_SIZE - 1) as u64)
        .with_big_endian()
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

fn write_string(buffer: &mut Vec<u8>, text: &str) -> Result<(), NetError> {
    let len = u32::try_from(text.len())
        .map_err(|_| NetError::Encode(Box::new(bincode::ErrorKind::SizeLimit)))?;
    wire_options().serialize_into(&mut *buffer, &len)?;
    buffer.extend_from_slice(text.as_bytes());
    Ok(())
}

fn read_string(payload: &[u8]) -> Option<String> {
    let len: u32 = wire_options().deserialize(payload).ok()?;
    let len = usize::try_from(len).ok()?;
    if len > MAX_PACKET_SIZE {
        return None;
    }

    let bytes = payload.get(4..)?.get(..len)?;
    String::from_utf8(bytes.to_vec()).ok()
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Disconnect => PacketType::Disconnect,
            Packet::Connect { .. } => PacketType::Connect,
            Packet::Heartbeat { .. } => PacketType::Heartbeat,
            Packet::Message { .. } => PacketType::Message,
            Packet::Reserved { kind, .. } => *kind,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, NetError> {
        let mut buffer = vec![self.packet_type().id() as u8];

        match self {
            Packet::Disconnect => {}
            Packet::Connect { player_name } => write_string(&mut buffer, player_name)?,
            Packet::Heartbeat { timestamp } => {
                wire_options().serialize_into(&mut buffer, timestamp)?
            }
            Packet::Message { text } => write_string(&mut buffer, text)?,
            Packet::Reserved { kind, payload } => {
                if !kind.is_reserved() {
                    return Err(NetError::Encode(Box::new(bincode::ErrorKind::Custom(
                        format!("{:?} cannot carry a raw payload", kind),
                    ))));
                }
                buffer.extend_from_slice(payload);
            }
        }

        if buffer.len() > MAX_PACKET_SIZE {
            return Err(NetError::Encode(Box::new(bincode::ErrorKind::SizeLimit)));
        }

        Ok(buffer)
    }

    pub fn decode(bytes: &[u8]) -> Option<Packet> {
        let (&id, payload) = bytes.split_first()?;
        let kind = PacketType::try_from(id as i8).ok()?;

        let packet = match kind {
            PacketType::Disconnect => Packet::Disconnect,
            PacketType::Connect => Packet::Connect {
                player_name: read_string(payload)?,
            },
            PacketType::Heartbeat => Packet::Heartbeat {
                timestamp: wire_options().deserialize(payload).ok()?,
            },
            PacketType::Message => Packet::Message {
                text: read_string(payload)?,
            },
            PacketType::Snapshot | PacketType::PlayerUpdate | PacketType::Hurt => {
                Packet::Reserved {
                    kind,
                    payload: payload.to_vec(),
                }
            }
        };

        Some(packet)
    }
}
