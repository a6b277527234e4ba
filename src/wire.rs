//! Wire format of Homa packets.
//!
//! Every packet begins with a 16-byte common header; most types add a small
//! fixed body after it. All multi-byte fields are network byte order, which
//! the bit-addressed accessors below produce directly (`Msb0` ordering over
//! a byte array is exactly the wire representation).

use std::fmt;

use bitvec::{field::BitField, order::Msb0, prelude as bv, view::BitView};
use paste::paste;
use thiserror::Error;

use crate::type_alias::*;

/// Number of distinct packet priority levels.
pub const HOMA_MAX_PRIORITIES: usize = 8;

/// Maximum number of acknowledgements carried by a single ACK packet.
pub const HOMA_MAX_ACKS_PER_PKT: usize = 5;

/// Size of the common header, in bytes.
pub(crate) const COMMON_HDR_SIZE: usize = 16;

macro_rules! impl_accessor {
    ($field:ident, $field_ty:ty, $integral_ty:ty, $lsb:expr, $msb:expr, $setter:tt, $getter:tt) => {
        #[inline(always)]
        pub fn $setter(&mut self, val: $field_ty) {
            self.bits[$lsb..=$msb].store_be::<$integral_ty>(val as $integral_ty);
        }

        #[inline(always)]
        pub fn $getter(&self) -> $field_ty {
            self.bits[$lsb..=$msb].load_be::<$integral_ty>().into()
        }
    };

    ($field:ident, $field_ty:ty, $integral_ty:ty, $lsb:expr, $msb:expr) => {
        paste! {
            impl_accessor!(
                $field,
                $field_ty,
                $integral_ty,
                $lsb,
                $msb,
                [< set_ $field >],
                $field
            );
        }
    };

    ($field:ident, $field_ty:ty, $lsb:expr, $msb:expr) => {
        paste! {
            impl_accessor!(
                $field,
                $field_ty,
                $field_ty,
                $lsb,
                $msb,
                [< set_ $field >],
                $field
            );
        }
    };
}

/// Packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum PktType {
    /// Message payload bytes.
    Data = 0x10,

    /// Authorization for the peer to send more scheduled bytes.
    Grant = 0x11,

    /// Request for retransmission of a byte range.
    Resend = 0x12,

    /// The sender has no record of the RPC named by the peer.
    RpcUnknown = 0x13,

    /// Progress signal: the RPC is alive but has nothing to transmit.
    Busy = 0x14,

    /// The sender's priority cutoff table.
    Cutoffs = 0x15,

    /// Debugging only: freeze internal trace state.
    Freeze = 0x16,

    /// Ask the peer to acknowledge a delivered response.
    NeedAck = 0x17,

    /// Batched acknowledgements of completed RPCs.
    Ack = 0x18,
}

impl TryFrom<u8> for PktType {
    type Error = WireError;

    fn try_from(val: u8) -> std::result::Result<Self, WireError> {
        match val {
            0x10 => Ok(Self::Data),
            0x11 => Ok(Self::Grant),
            0x12 => Ok(Self::Resend),
            0x13 => Ok(Self::RpcUnknown),
            0x14 => Ok(Self::Busy),
            0x15 => Ok(Self::Cutoffs),
            0x16 => Ok(Self::Freeze),
            0x17 => Ok(Self::NeedAck),
            0x18 => Ok(Self::Ack),
            _ => Err(WireError::BadPacketType(val)),
        }
    }
}

/// Errors produced while decoding an inbound packet. The dispatcher treats
/// every variant the same way: drop the packet and bump a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub(crate) enum WireError {
    #[error("packet shorter than the common header")]
    TooShort,

    #[error("unknown packet type {0:#x}")]
    BadPacketType(u8),

    #[error("header length field inconsistent with packet type")]
    BadHeaderLength,

    #[error("packet truncated before the end of its header")]
    Truncated,
}

/// Common packet header, 16 bytes.
///
/// # Layout (bits, network order)
///
/// | Lsb | Msb |    Name    |
/// | --: | --: | ---------- |
/// |   0 |  15 | sport      |
/// |  16 |  31 | dport      |
/// |  32 |  39 | doff       |
/// |  40 |  47 | pkt_type   |
/// |  48 |  63 | checksum   |
/// |  64 | 127 | sender_id  |
///
/// `doff` is the header length in 4-byte units. `sender_id` is the sender's
/// id for the RPC; the receiver XORs the low bit to localize it.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct CommonHeader {
    bits: bv::BitArr!(for 128, in u8, Msb0),
}

impl CommonHeader {
    impl_accessor!(sport, Port, 0, 15);
    impl_accessor!(dport, Port, 16, 31);
    impl_accessor!(doff, u8, 32, 39);
    impl_accessor!(pkt_type_raw, u8, 40, 47);
    impl_accessor!(checksum, u16, 48, 63);
    impl_accessor!(sender_id, RpcId, 64, 127);

    pub fn new(sport: Port, dport: Port, pkt_type: PktType, sender_id: RpcId) -> Self {
        let mut this = Self::default();
        this.set_sport(sport);
        this.set_dport(dport);
        this.set_doff((pkt_hdr_len(pkt_type) / 4) as u8);
        this.set_pkt_type_raw(pkt_type as u8);
        // Checksums are delegated to the driver's own integrity layer.
        this.set_checksum(0);
        this.set_sender_id(sender_id);
        this
    }

    /// Decode the packet type, rejecting values outside the known set.
    #[inline]
    pub fn pkt_type(&self) -> std::result::Result<PktType, WireError> {
        PktType::try_from(self.pkt_type_raw())
    }

    /// The wire representation of this header.
    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8; COMMON_HDR_SIZE] {
        self.bits.as_raw_slice().try_into().unwrap()
    }

    pub fn from_bytes(src: &[u8]) -> std::result::Result<Self, WireError> {
        if src.len() < COMMON_HDR_SIZE {
            return Err(WireError::TooShort);
        }
        let mut this = Self::default();
        this.bits.as_raw_mut_slice().copy_from_slice(&src[..COMMON_HDR_SIZE]);
        Ok(this)
    }
}

impl Default for CommonHeader {
    fn default() -> Self {
        Self {
            bits: bv::bitarr![u8, Msb0; 0; 128],
        }
    }
}

impl fmt::Debug for CommonHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommonHeader")
            .field("sport", &self.sport())
            .field("dport", &self.dport())
            .field("doff", &self.doff())
            .field("pkt_type", &self.pkt_type())
            .field("checksum", &self.checksum())
            .field("sender_id", &self.sender_id())
            .finish()
    }
}

/// Full header length in bytes for each packet type.
pub(crate) const fn pkt_hdr_len(pkt_type: PktType) -> usize {
    COMMON_HDR_SIZE
        + match pkt_type {
            PktType::Data => 16,
            PktType::Grant => 8,
            PktType::Resend => 12,
            PktType::Cutoffs => 36,
            PktType::Ack => 4 + 12 * HOMA_MAX_ACKS_PER_PKT,
            PktType::RpcUnknown
            | PktType::Busy
            | PktType::Freeze
            | PktType::NeedAck => 0,
        }
}

// Body field offsets are relative to the end of the common header.
#[inline]
fn get_u32(body: &[u8], at: usize) -> u32 {
    body[at..at + 4].view_bits::<Msb0>().load_be()
}

#[inline]
fn get_u16(body: &[u8], at: usize) -> u16 {
    body[at..at + 2].view_bits::<Msb0>().load_be()
}

#[inline]
fn get_u64(body: &[u8], at: usize) -> u64 {
    body[at..at + 8].view_bits::<Msb0>().load_be()
}

#[inline]
fn put_u32(out: &mut Vec<u8>, val: u32) {
    out.extend_from_slice(&val.to_be_bytes());
}

#[inline]
fn put_u16(out: &mut Vec<u8>, val: u16) {
    out.extend_from_slice(&val.to_be_bytes());
}

#[inline]
fn put_u64(out: &mut Vec<u8>, val: u64) {
    out.extend_from_slice(&val.to_be_bytes());
}

/// DATA header: common header plus segment metadata. The segment payload
/// follows the header; its length is implied by the packet length.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DataHeader {
    pub common: CommonHeader,

    /// Total length of the message this segment belongs to.
    pub message_length: u32,

    /// Cumulative bytes the sender is currently authorized to send
    /// (unscheduled prefix plus received grants).
    pub incoming: u32,

    /// Version of the priority cutoffs the sender last saw from us.
    pub cutoff_version: u16,

    /// Nonzero if this segment is a retransmission.
    pub retransmit: u8,

    /// Offset of this segment's first byte within the message.
    pub seg_offset: u32,
}

impl DataHeader {
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(pkt_hdr_len(PktType::Data) + payload.len());
        out.extend_from_slice(self.common.as_bytes());
        put_u32(&mut out, self.message_length);
        put_u32(&mut out, self.incoming);
        put_u16(&mut out, self.cutoff_version);
        out.push(self.retransmit);
        out.push(0);
        put_u32(&mut out, self.seg_offset);
        out.extend_from_slice(payload);
        out
    }

    fn decode(common: CommonHeader, body: &[u8]) -> Self {
        Self {
            common,
            message_length: get_u32(body, 0),
            incoming: get_u32(body, 4),
            cutoff_version: get_u16(body, 8),
            retransmit: body[10],
            seg_offset: get_u32(body, 12),
        }
    }
}

/// GRANT header.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GrantHeader {
    pub common: CommonHeader,

    /// New cumulative byte authorization for the peer's outgoing message.
    pub offset: u32,

    /// Priority the peer should use for the granted bytes.
    pub priority: Priority,

    /// Nonzero asks the peer to retransmit everything it has already sent.
    pub resend_all: u8,
}

impl GrantHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(pkt_hdr_len(PktType::Grant));
        out.extend_from_slice(self.common.as_bytes());
        put_u32(&mut out, self.offset);
        out.push(self.priority);
        out.push(self.resend_all);
        put_u16(&mut out, 0);
        out
    }

    fn decode(common: CommonHeader, body: &[u8]) -> Self {
        Self {
            common,
            offset: get_u32(body, 0),
            priority: body[4],
            resend_all: body[5],
        }
    }
}

/// RESEND header, naming a byte range the receiver is missing.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ResendHeader {
    pub common: CommonHeader,
    pub offset: u32,
    pub length: u32,

    /// Priority at which the range should be retransmitted.
    pub priority: Priority,
}

impl ResendHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(pkt_hdr_len(PktType::Resend));
        out.extend_from_slice(self.common.as_bytes());
        put_u32(&mut out, self.offset);
        put_u32(&mut out, self.length);
        out.push(self.priority);
        out.extend_from_slice(&[0; 3]);
        out
    }

    fn decode(common: CommonHeader, body: &[u8]) -> Self {
        Self {
            common,
            offset: get_u32(body, 0),
            length: get_u32(body, 4),
            priority: body[8],
        }
    }
}

/// CUTOFFS header: the sender's priority cutoff table.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CutoffsHeader {
    pub common: CommonHeader,
    pub unsched_cutoffs: [u32; HOMA_MAX_PRIORITIES],
    pub cutoff_version: u16,
}

impl CutoffsHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(pkt_hdr_len(PktType::Cutoffs));
        out.extend_from_slice(self.common.as_bytes());
        for cutoff in self.unsched_cutoffs {
            put_u32(&mut out, cutoff);
        }
        put_u16(&mut out, self.cutoff_version);
        put_u16(&mut out, 0);
        out
    }

    fn decode(common: CommonHeader, body: &[u8]) -> Self {
        let mut unsched_cutoffs = [0u32; HOMA_MAX_PRIORITIES];
        for (i, cutoff) in unsched_cutoffs.iter_mut().enumerate() {
            *cutoff = get_u32(body, i * 4);
        }
        Self {
            common,
            unsched_cutoffs,
            cutoff_version: get_u16(body, HOMA_MAX_PRIORITIES * 4),
        }
    }
}

/// A single acknowledgement: the client's id for a completed RPC, plus the
/// port of the server socket that owns its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RpcAck {
    pub client_id: RpcId,
    pub server_port: Port,
}

/// ACK header: up to [`HOMA_MAX_ACKS_PER_PKT`] batched acknowledgements.
/// The id in the common header counts as one additional acknowledgement.
#[derive(Debug, Clone)]
pub(crate) struct AckHeader {
    pub common: CommonHeader,
    pub acks: Vec<RpcAck>,
}

impl AckHeader {
    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(self.acks.len() <= HOMA_MAX_ACKS_PER_PKT);
        let mut out = Vec::with_capacity(pkt_hdr_len(PktType::Ack));
        out.extend_from_slice(self.common.as_bytes());
        put_u16(&mut out, self.acks.len() as u16);
        put_u16(&mut out, 0);
        for slot in 0..HOMA_MAX_ACKS_PER_PKT {
            let ack = self.acks.get(slot).copied().unwrap_or(RpcAck {
                client_id: 0,
                server_port: 0,
            });
            put_u64(&mut out, ack.client_id);
            put_u16(&mut out, ack.server_port);
            put_u16(&mut out, 0);
        }
        out
    }

    fn decode(common: CommonHeader, body: &[u8]) -> Self {
        let num_acks = (get_u16(body, 0) as usize).min(HOMA_MAX_ACKS_PER_PKT);
        let acks = (0..num_acks)
            .map(|slot| RpcAck {
                client_id: get_u64(body, 4 + slot * 12),
                server_port: get_u16(body, 4 + slot * 12 + 8),
            })
            .collect();
        Self { common, acks }
    }
}

/// A decoded inbound packet.
#[derive(Debug)]
pub(crate) enum Packet<'a> {
    Data(DataHeader, &'a [u8]),
    Grant(GrantHeader),
    Resend(ResendHeader),
    RpcUnknown(CommonHeader),
    Busy(CommonHeader),
    Cutoffs(CutoffsHeader),
    Freeze(CommonHeader),
    NeedAck(CommonHeader),
    Ack(AckHeader),
}

impl<'a> Packet<'a> {
    /// Decode a raw packet. Returns an error if the header is malformed;
    /// the caller drops such packets without side effects.
    pub fn parse(bytes: &'a [u8]) -> std::result::Result<Self, WireError> {
        let common = CommonHeader::from_bytes(bytes)?;
        let pkt_type = common.pkt_type()?;

        let hdr_len = (common.doff() as usize) * 4;
        if hdr_len < pkt_hdr_len(pkt_type) {
            return Err(WireError::BadHeaderLength);
        }
        if bytes.len() < hdr_len {
            return Err(WireError::Truncated);
        }
        let body = &bytes[COMMON_HDR_SIZE..];

        Ok(match pkt_type {
            PktType::Data => Packet::Data(DataHeader::decode(common, body), &bytes[hdr_len..]),
            PktType::Grant => Packet::Grant(GrantHeader::decode(common, body)),
            PktType::Resend => Packet::Resend(ResendHeader::decode(common, body)),
            PktType::RpcUnknown => Packet::RpcUnknown(common),
            PktType::Busy => Packet::Busy(common),
            PktType::Cutoffs => Packet::Cutoffs(CutoffsHeader::decode(common, body)),
            PktType::Freeze => Packet::Freeze(common),
            PktType::NeedAck => Packet::NeedAck(common),
            PktType::Ack => Packet::Ack(AckHeader::decode(common, body)),
        })
    }

    /// The common header shared by all variants.
    pub fn common(&self) -> &CommonHeader {
        match self {
            Packet::Data(h, _) => &h.common,
            Packet::Grant(h) => &h.common,
            Packet::Resend(h) => &h.common,
            Packet::RpcUnknown(c) => c,
            Packet::Busy(c) => c,
            Packet::Cutoffs(h) => &h.common,
            Packet::Freeze(c) => c,
            Packet::NeedAck(c) => c,
            Packet::Ack(h) => &h.common,
        }
    }
}

/// Localize the RPC id found in a packet header: the sender stores its own
/// id, whose low bit is the inverse of ours.
#[inline(always)]
pub(crate) const fn local_id(sender_id: RpcId) -> RpcId {
    sender_id ^ 1
}

/// Return `true` if the id denotes a client RPC on this end.
#[inline(always)]
pub(crate) const fn id_is_client(id: RpcId) -> bool {
    id & 1 == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn test_common_layout() {
        assert_eq!(mem::size_of::<CommonHeader>(), COMMON_HDR_SIZE);

        let hdr = CommonHeader::new(40000, 99, PktType::Data, 0x1234_5678_9abc_def0);
        let bytes = hdr.as_bytes();

        // Network byte order on the wire.
        assert_eq!(&bytes[0..2], &40000u16.to_be_bytes());
        assert_eq!(&bytes[2..4], &99u16.to_be_bytes());
        assert_eq!(bytes[4], 8); // doff: 32-byte DATA header
        assert_eq!(bytes[5], PktType::Data as u8);
        assert_eq!(&bytes[8..16], &0x1234_5678_9abc_def0u64.to_be_bytes());
    }

    #[test]
    fn test_common_roundtrip() {
        let hdr = CommonHeader::new(1, 2, PktType::NeedAck, 42);
        let parsed = CommonHeader::from_bytes(hdr.as_bytes()).unwrap();
        assert_eq!(parsed.sport(), 1);
        assert_eq!(parsed.dport(), 2);
        assert_eq!(parsed.pkt_type(), Ok(PktType::NeedAck));
        assert_eq!(parsed.sender_id(), 42);
    }

    #[test]
    fn test_data_roundtrip() {
        let hdr = DataHeader {
            common: CommonHeader::new(40000, 99, PktType::Data, 1234),
            message_length: 5000,
            incoming: 10000,
            cutoff_version: 3,
            retransmit: 1,
            seg_offset: 1400,
        };
        let bytes = hdr.encode(b"payload");

        match Packet::parse(&bytes).unwrap() {
            Packet::Data(parsed, payload) => {
                assert_eq!(parsed.message_length, 5000);
                assert_eq!(parsed.incoming, 10000);
                assert_eq!(parsed.cutoff_version, 3);
                assert_eq!(parsed.retransmit, 1);
                assert_eq!(parsed.seg_offset, 1400);
                assert_eq!(payload, b"payload");
            }
            other => panic!("wrong packet type: {:?}", other),
        }
    }

    #[test]
    fn test_ack_roundtrip() {
        let hdr = AckHeader {
            common: CommonHeader::new(99, 40000, PktType::Ack, 1235),
            acks: vec![
                RpcAck { client_id: 100, server_port: 99 },
                RpcAck { client_id: 102, server_port: 98 },
            ],
        };
        let bytes = hdr.encode();
        assert_eq!(bytes.len(), pkt_hdr_len(PktType::Ack));

        match Packet::parse(&bytes).unwrap() {
            Packet::Ack(parsed) => {
                assert_eq!(parsed.acks.len(), 2);
                assert_eq!(parsed.acks[0], RpcAck { client_id: 100, server_port: 99 });
                assert_eq!(parsed.acks[1], RpcAck { client_id: 102, server_port: 98 });
            }
            other => panic!("wrong packet type: {:?}", other),
        }
    }

    #[test]
    fn test_malformed() {
        assert_eq!(Packet::parse(&[0u8; 8]).unwrap_err(), WireError::TooShort);

        let mut hdr = CommonHeader::new(1, 2, PktType::Busy, 0);
        hdr.set_pkt_type_raw(0x42);
        assert_eq!(
            Packet::parse(hdr.as_bytes()).unwrap_err(),
            WireError::BadPacketType(0x42)
        );

        // GRANT truncated to just the common header.
        let grant = GrantHeader {
            common: CommonHeader::new(1, 2, PktType::Grant, 0),
            offset: 100,
            priority: 1,
            resend_all: 0,
        };
        let bytes = grant.encode();
        assert_eq!(
            Packet::parse(&bytes[..COMMON_HDR_SIZE]).unwrap_err(),
            WireError::Truncated
        );
    }

    #[test]
    fn test_id_localization() {
        assert_eq!(local_id(100), 101);
        assert_eq!(local_id(101), 100);
        assert!(id_is_client(100));
        assert!(!id_is_client(101));
    }
}
