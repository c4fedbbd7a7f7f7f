//! Wire codec for the time sync protocol.
//!
//! Five packet types ride a single UDP port.  Every packet starts with a
//! 24-byte header and all multi-byte fields are big-endian:
//!
//! ```text
//! offset  size  field
//!      0     4  magic ("cclk")
//!      4     2  protocol version
//!      6     2  packet type
//!      8     8  timeline ID (0 = none)
//!     16     8  sync-group ID
//! ```
//!
//! Device identity travels packed into one 64-bit field: the election
//! priority in the top byte, the 56-bit device ID below it.

use bytes::{Buf, BufMut};

use crate::{Result, TimeServiceError};

/// Protocol magic number, "cclk".
pub const MAGIC: u32 = 0x6363_6C6B;

/// Current protocol version.
pub const PROTOCOL_VERSION: u16 = 1;

/// Fixed header length in bytes.
pub const HEADER_LEN: usize = 24;

/// Largest encoded packet (header + sync response body).
pub const MAX_PACKET_LEN: usize = HEADER_LEN + 28;

const DEVICE_PRIORITY_SHIFT: u32 = 56;
const DEVICE_ID_MASK: u64 = (1u64 << DEVICE_PRIORITY_SHIFT) - 1;

/// Pack a device ID and election priority into the on-wire field.
pub fn pack_device_id(device_id: u64, priority: u8) -> u64 {
    (device_id & DEVICE_ID_MASK) | ((priority as u64) << DEVICE_PRIORITY_SHIFT)
}

/// Split an on-wire packed device field into (device ID, priority).
pub fn unpack_device_id(packed: u64) -> (u64, u8) {
    (
        packed & DEVICE_ID_MASK,
        (packed >> DEVICE_PRIORITY_SHIFT) as u8,
    )
}

/// On-wire packet type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum PacketType {
    WhoIsMasterRequest = 1,
    WhoIsMasterResponse = 2,
    SyncRequest = 3,
    SyncResponse = 4,
    MasterAnnouncement = 5,
}

impl PacketType {
    fn from_wire(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(Self::WhoIsMasterRequest),
            2 => Some(Self::WhoIsMasterResponse),
            3 => Some(Self::SyncRequest),
            4 => Some(Self::SyncResponse),
            5 => Some(Self::MasterAnnouncement),
            _ => None,
        }
    }
}

/// Broadcast query for a master serving a timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WhoIsMasterRequest {
    /// Timeline being sought; 0 queries for any master.
    pub timeline_id: u64,
    pub group_id: u64,
    pub sender_device_id: u64,
    pub sender_priority: u8,
}

/// Unicast reply from a master to a WhoIsMaster request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WhoIsMasterResponse {
    pub timeline_id: u64,
    pub group_id: u64,
    pub device_id: u64,
    pub priority: u8,
}

/// Client request for a local/common time correspondence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncRequest {
    pub timeline_id: u64,
    pub group_id: u64,
    /// Client local time at transmission.
    pub client_tx_local: i64,
}

/// Master reply carrying its RX/TX times in common units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncResponse {
    pub timeline_id: u64,
    pub group_id: u64,
    /// Echo of the client's TX local time.
    pub client_tx_local: i64,
    pub master_rx_common: i64,
    pub master_tx_common: i64,
    /// Nonzero when the responder is not master of the requested timeline.
    pub nak: u32,
}

/// Periodic broadcast asserting mastership of a timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterAnnouncement {
    pub timeline_id: u64,
    pub group_id: u64,
    pub device_id: u64,
    pub priority: u8,
}

/// A decoded time service packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimePacket {
    WhoIsMasterRequest(WhoIsMasterRequest),
    WhoIsMasterResponse(WhoIsMasterResponse),
    SyncRequest(SyncRequest),
    SyncResponse(SyncResponse),
    MasterAnnouncement(MasterAnnouncement),
}

impl TimePacket {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::WhoIsMasterRequest(_) => PacketType::WhoIsMasterRequest,
            Self::WhoIsMasterResponse(_) => PacketType::WhoIsMasterResponse,
            Self::SyncRequest(_) => PacketType::SyncRequest,
            Self::SyncResponse(_) => PacketType::SyncResponse,
            Self::MasterAnnouncement(_) => PacketType::MasterAnnouncement,
        }
    }

    pub fn timeline_id(&self) -> u64 {
        match self {
            Self::WhoIsMasterRequest(p) => p.timeline_id,
            Self::WhoIsMasterResponse(p) => p.timeline_id,
            Self::SyncRequest(p) => p.timeline_id,
            Self::SyncResponse(p) => p.timeline_id,
            Self::MasterAnnouncement(p) => p.timeline_id,
        }
    }

    pub fn group_id(&self) -> u64 {
        match self {
            Self::WhoIsMasterRequest(p) => p.group_id,
            Self::WhoIsMasterResponse(p) => p.group_id,
            Self::SyncRequest(p) => p.group_id,
            Self::SyncResponse(p) => p.group_id,
            Self::MasterAnnouncement(p) => p.group_id,
        }
    }

    /// Serialize into `buf`, returning the encoded length.
    pub fn encode(&self, buf: &mut Vec<u8>) -> usize {
        let start = buf.len();
        buf.put_u32(MAGIC);
        buf.put_u16(PROTOCOL_VERSION);
        buf.put_u16(self.packet_type() as u16);
        buf.put_u64(self.timeline_id());
        buf.put_u64(self.group_id());

        match self {
            Self::WhoIsMasterRequest(p) => {
                buf.put_u64(pack_device_id(p.sender_device_id, p.sender_priority));
            }
            Self::WhoIsMasterResponse(p) => {
                buf.put_u64(pack_device_id(p.device_id, p.priority));
            }
            Self::SyncRequest(p) => {
                buf.put_i64(p.client_tx_local);
            }
            Self::SyncResponse(p) => {
                buf.put_i64(p.client_tx_local);
                buf.put_i64(p.master_rx_common);
                buf.put_i64(p.master_tx_common);
                buf.put_u32(p.nak);
            }
            Self::MasterAnnouncement(p) => {
                buf.put_u64(pack_device_id(p.device_id, p.priority));
            }
        }

        buf.len() - start
    }

    /// Parse a datagram.
    ///
    /// `expected_group` is this node's sync group; traffic tagged with a
    /// different nonzero group is rejected when our own group is nonzero.
    pub fn decode(data: &[u8], expected_group: u64) -> Result<TimePacket> {
        let mut buf = data;

        if buf.remaining() < HEADER_LEN {
            return Err(TimeServiceError::BadPacket("truncated header"));
        }

        let magic = buf.get_u32();
        if magic != MAGIC {
            return Err(TimeServiceError::BadPacket("bad magic"));
        }

        let version = buf.get_u16();
        if version != PROTOCOL_VERSION {
            return Err(TimeServiceError::BadPacket("unsupported version"));
        }

        let packet_type = PacketType::from_wire(buf.get_u16())
            .ok_or(TimeServiceError::BadPacket("unknown packet type"))?;
        let timeline_id = buf.get_u64();
        let group_id = buf.get_u64();

        if expected_group != 0 && group_id != 0 && group_id != expected_group {
            return Err(TimeServiceError::BadPacket("wrong sync group"));
        }

        let packet = match packet_type {
            PacketType::WhoIsMasterRequest => {
                if buf.remaining() < 8 {
                    return Err(TimeServiceError::BadPacket("truncated body"));
                }
                let (sender_device_id, sender_priority) = unpack_device_id(buf.get_u64());
                TimePacket::WhoIsMasterRequest(WhoIsMasterRequest {
                    timeline_id,
                    group_id,
                    sender_device_id,
                    sender_priority,
                })
            }
            PacketType::WhoIsMasterResponse => {
                if buf.remaining() < 8 {
                    return Err(TimeServiceError::BadPacket("truncated body"));
                }
                let (device_id, priority) = unpack_device_id(buf.get_u64());
                TimePacket::WhoIsMasterResponse(WhoIsMasterResponse {
                    timeline_id,
                    group_id,
                    device_id,
                    priority,
                })
            }
            PacketType::SyncRequest => {
                if buf.remaining() < 8 {
                    return Err(TimeServiceError::BadPacket("truncated body"));
                }
                TimePacket::SyncRequest(SyncRequest {
                    timeline_id,
                    group_id,
                    client_tx_local: buf.get_i64(),
                })
            }
            PacketType::SyncResponse => {
                if buf.remaining() < 28 {
                    return Err(TimeServiceError::BadPacket("truncated body"));
                }
                TimePacket::SyncResponse(SyncResponse {
                    timeline_id,
                    group_id,
                    client_tx_local: buf.get_i64(),
                    master_rx_common: buf.get_i64(),
                    master_tx_common: buf.get_i64(),
                    nak: buf.get_u32(),
                })
            }
            PacketType::MasterAnnouncement => {
                if buf.remaining() < 8 {
                    return Err(TimeServiceError::BadPacket("truncated body"));
                }
                let (device_id, priority) = unpack_device_id(buf.get_u64());
                TimePacket::MasterAnnouncement(MasterAnnouncement {
                    timeline_id,
                    group_id,
                    device_id,
                    priority,
                })
            }
        };

        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packets() -> Vec<TimePacket> {
        vec![
            TimePacket::WhoIsMasterRequest(WhoIsMasterRequest {
                timeline_id: 0,
                group_id: 7,
                sender_device_id: 0x0000_1122_3344_5566,
                sender_priority: 0x81,
            }),
            TimePacket::WhoIsMasterResponse(WhoIsMasterResponse {
                timeline_id: 0xDEAD_BEEF_CAFE_F00D,
                group_id: 7,
                device_id: 0x0000_1122_3344_5577,
                priority: 0x85,
            }),
            TimePacket::SyncRequest(SyncRequest {
                timeline_id: 42,
                group_id: 0,
                client_tx_local: -123_456_789,
            }),
            TimePacket::SyncResponse(SyncResponse {
                timeline_id: 42,
                group_id: 0,
                client_tx_local: i64::MIN,
                master_rx_common: i64::MAX,
                master_tx_common: 0,
                nak: 1,
            }),
            TimePacket::MasterAnnouncement(MasterAnnouncement {
                timeline_id: u64::MAX,
                group_id: 7,
                device_id: 0x0000_FFFF_FFFF_FFFF,
                priority: 0,
            }),
        ]
    }

    #[test]
    fn round_trip_all_packet_types() {
        for packet in sample_packets() {
            let mut buf = Vec::with_capacity(MAX_PACKET_LEN);
            let len = packet.encode(&mut buf);
            assert_eq!(len, buf.len());
            assert!(len <= MAX_PACKET_LEN);

            let decoded = TimePacket::decode(&buf, packet.group_id()).unwrap();
            assert_eq!(decoded, packet);
        }
    }

    #[test]
    fn header_layout_is_bit_exact() {
        let packet = TimePacket::SyncRequest(SyncRequest {
            timeline_id: 0x0102_0304_0506_0708,
            group_id: 0x1112_1314_1516_1718,
            client_tx_local: 0x2122_2324_2526_2728,
        });
        let mut buf = Vec::new();
        packet.encode(&mut buf);

        assert_eq!(&buf[0..4], b"cclk");
        assert_eq!(&buf[4..6], &[0x00, 0x01]); // version
        assert_eq!(&buf[6..8], &[0x00, 0x03]); // sync request
        assert_eq!(&buf[8..16], &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
        assert_eq!(&buf[16..24], &[0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18]);
        assert_eq!(&buf[24..32], &[0x21, 0x22, 0x23, 0x24, 0x25, 0x26, 0x27, 0x28]);
        assert_eq!(buf.len(), 32);
    }

    #[test]
    fn device_packing_splits_priority_and_id() {
        let packed = pack_device_id(0x0000_1122_3344_5566, 0xAB);
        assert_eq!(packed, 0xAB00_1122_3344_5566);
        assert_eq!(unpack_device_id(packed), (0x0000_1122_3344_5566, 0xAB));

        // A device ID wider than 56 bits is masked on the way in.
        let packed = pack_device_id(u64::MAX, 1);
        assert_eq!(unpack_device_id(packed), (DEVICE_ID_MASK, 1));
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        let mut buf = Vec::new();
        TimePacket::SyncRequest(SyncRequest {
            timeline_id: 1,
            group_id: 0,
            client_tx_local: 0,
        })
        .encode(&mut buf);

        let mut bad_magic = buf.clone();
        bad_magic[0] = b'x';
        assert!(matches!(
            TimePacket::decode(&bad_magic, 0),
            Err(TimeServiceError::BadPacket("bad magic"))
        ));

        let mut bad_version = buf.clone();
        bad_version[5] = 2;
        assert!(matches!(
            TimePacket::decode(&bad_version, 0),
            Err(TimeServiceError::BadPacket("unsupported version"))
        ));
    }

    #[test]
    fn rejects_truncation_and_unknown_type() {
        let mut buf = Vec::new();
        TimePacket::SyncResponse(SyncResponse {
            timeline_id: 1,
            group_id: 0,
            client_tx_local: 1,
            master_rx_common: 2,
            master_tx_common: 3,
            nak: 0,
        })
        .encode(&mut buf);

        assert!(matches!(
            TimePacket::decode(&buf[..HEADER_LEN - 1], 0),
            Err(TimeServiceError::BadPacket("truncated header"))
        ));
        assert!(matches!(
            TimePacket::decode(&buf[..buf.len() - 1], 0),
            Err(TimeServiceError::BadPacket("truncated body"))
        ));

        let mut unknown = buf.clone();
        unknown[7] = 99;
        assert!(matches!(
            TimePacket::decode(&unknown, 0),
            Err(TimeServiceError::BadPacket("unknown packet type"))
        ));
    }

    #[test]
    fn sync_group_filtering() {
        let make = |group| {
            let mut buf = Vec::new();
            TimePacket::SyncRequest(SyncRequest {
                timeline_id: 1,
                group_id: group,
                client_tx_local: 0,
            })
            .encode(&mut buf);
            buf
        };

        // Our group 0: accept everything.
        assert!(TimePacket::decode(&make(0), 0).is_ok());
        assert!(TimePacket::decode(&make(9), 0).is_ok());

        // Our group nonzero: accept matching and untagged traffic only.
        assert!(TimePacket::decode(&make(7), 7).is_ok());
        assert!(TimePacket::decode(&make(0), 7).is_ok());
        assert!(matches!(
            TimePacket::decode(&make(9), 7),
            Err(TimeServiceError::BadPacket("wrong sync group"))
        ));
    }
}
