//! Firmware wire formats.
//!
//! All multi-byte values are little endian. The bit layouts are dictated by the firmware and must
//! not be changed.
use bitfield_struct::bitfield;
use macro_bits::serializable_enum;

use crate::seq::SeqNum;

/// Size of the MH descriptor, which prefixes every PCIe receive buffer.
pub const RX_MH_DESC_LEN: usize = 28;
/// Length of the ethernet header stripped from later fragments, if a SNAP header is present.
pub const ETH_HEADER_LEN: usize = 14;
/// Length of the two MAC addresses stripped from later fragments, if no SNAP header is present.
pub const ETH_ADDRS_LEN: usize = 12;
/// The ID of the flow control event.
pub const EVT_FLOW_CONTROL: u8 = 0xb3;

serializable_enum! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    /// The type of a message exchanged with the firmware.
    pub enum HeadType: u8 {
        Command => 0,
        Event => 1,
        Data => 2,
        DataSpecial => 3,
        DataPcieAddr => 4,
        PacketLog => 5
    }
}
serializable_enum! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    /// The cipher the firmware used to decrypt a frame.
    pub enum CipherType: u8 {
        Wep40 => 0,
        Tkip => 1,
        Ccmp => 2,
        NoCipher => 3,
        Wep104 => 4,
        Gcmp128 => 5,
        Gcmp256 => 6,
        Wapi => 7,
        Ccmp256 => 8
    }
}
impl CipherType {
    /// Check if the firmware reports a usable packet number for this cipher.
    pub fn has_replay_counter(&self) -> bool {
        matches!(self, Self::Tkip | Self::Ccmp)
    }
}

/// The header at the start of every message.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct CommonHeader {
    #[bits(3)]
    pub raw_type: u8,
    /// Set on address-handoff messages.
    pub reserved: bool,
    pub rsp: bool,
    #[bits(3)]
    pub ctx_id: u8,
}
impl CommonHeader {
    pub fn head_type(&self) -> HeadType {
        HeadType::from_bits(self.raw_type())
    }
    pub fn with_head_type(self, head_type: HeadType) -> Self {
        self.with_raw_type(head_type.into_bits())
    }
    /// Read the header from the first byte of `bytes`.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        bytes.first().map(|byte| Self::from_bits(*byte))
    }
}

/// The header of commands and events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CmdHeader {
    pub common: CommonHeader,
    pub cmd_id: u8,
    /// The payload length, including this header.
    pub payload_len: u16,
    pub ms_time: u32,
    pub status: i8,
    pub rsp_count: u8,
}
impl CmdHeader {
    pub const LEN: usize = 12;
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let bytes = bytes.get(..Self::LEN)?;
        Some(Self {
            common: CommonHeader::from_bits(bytes[0]),
            cmd_id: bytes[1],
            payload_len: u16::from_le_bytes([bytes[2], bytes[3]]),
            ms_time: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            status: bytes[8] as i8,
            rsp_count: bytes[9],
        })
    }
    pub fn write(&self, bytes: &mut [u8]) -> Option<()> {
        let bytes = bytes.get_mut(..Self::LEN)?;
        bytes[0] = self.common.into_bits();
        bytes[1] = self.cmd_id;
        bytes[2..4].copy_from_slice(&self.payload_len.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.ms_time.to_le_bytes());
        bytes[8] = self.status as u8;
        bytes[9] = self.rsp_count;
        bytes[10..12].fill(0);
        Some(())
    }
}

/// Third word of the MH descriptor.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct MhChecksumCtrl {
    #[bits(12)]
    pub tcp_checksum_offset: u16,
    pub tcp_checksum_len: u16,
    pub tcp_checksum_en: bool,
    #[bits(3)]
    pub __: u8,
}
/// Fourth word of the MH descriptor.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct MhChecksumResult {
    pub tcp_hw_checksum: u16,
    pub last_procq_msdu_of_buff: bool,
    #[bits(7)]
    pub __: u8,
    #[bits(6)]
    pub filter_status: u8,
    pub msdu_sta_ps_flag: bool,
    pub filter_flag: bool,
}
/// Read the hardware checksum from the MH descriptor at the start of a PCIe receive buffer.
pub fn mh_checksum(buffer: &[u8]) -> Option<u16> {
    let words = buffer.get(8..16)?;
    let ctrl = MhChecksumCtrl::from_bits(u32::from_le_bytes([
        words[0], words[1], words[2], words[3],
    ]));
    let result = MhChecksumResult::from_bits(u32::from_le_bytes([
        words[4], words[5], words[6], words[7],
    ]));
    ctrl.tcp_checksum_en().then(|| result.tcp_hw_checksum())
}

#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct MsduLayout {
    #[bits(4)]
    pub host_type: u8,
    #[bits(4)]
    pub ctx_id: u8,
    /// Offset of the MSDU from the start of the descriptor.
    pub msdu_offset: u8,
    pub msdu_len: u16,
}
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct MsduPosition {
    /// For compound SDIO buffers, the number of MSDUs packed into the buffer.
    pub short_pkt_num: u8,
    pub msdu_index_of_mpdu: u8,
    pub first_msdu_of_buff: bool,
    pub last_msdu_of_buff: bool,
    #[bits(2)]
    pub __: u8,
    pub first_msdu_of_mpdu: bool,
    pub last_msdu_of_mpdu: bool,
    pub null_frame: bool,
    pub qos_null: bool,
    pub first_buff_of_mpdu: bool,
    pub last_buff_of_mpdu: bool,
    pub sta_lut_valid: bool,
    #[bits(5)]
    pub sta_lut_index: u8,
}
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct MsduFlags {
    pub more_data: bool,
    pub eosp: bool,
    pub pm: bool,
    pub bc_mc_w2w: bool,
    pub bc_mc: bool,
    pub uc_w2w: bool,
    pub eapol: bool,
    pub vlan: bool,
    pub snap_hdr_present: bool,
    pub snap_hdr_type: bool,
    pub ba_session: bool,
    pub ampdu: bool,
    pub amsdu: bool,
    pub qos: bool,
    #[bits(2)]
    pub __: u8,
    #[bits(4)]
    pub tid: u8,
    #[bits(12)]
    pub seq_num: u16,
}
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct MsduSecurity {
    pub pn_high: u16,
    #[bits(4)]
    pub frag_num: u8,
    pub more_frag: bool,
    pub retry: bool,
    #[bits(2)]
    pub __reserved0: u8,
    #[bits(4)]
    pub cipher_type: u8,
    #[bits(3)]
    pub __reserved1: u8,
    /// Set by the device once it finished writing the buffer.
    pub data_write_done: bool,
}

/// The descriptor the firmware prepends to every received MSDU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RxMsduDesc {
    pub layout: MsduLayout,
    pub buffer_addr_low: u32,
    pub position: MsduPosition,
    pub flags: MsduFlags,
    pub pn_low: u32,
    pub security: MsduSecurity,
    /// Carries four bytes of TX credit on [HeadType::DataSpecial] frames.
    pub reserved: u32,
}
impl RxMsduDesc {
    pub const LEN: usize = 28;
    /// Byte offset of the word holding the write-done bit.
    const SECURITY_OFFSET: usize = 20;

    fn word(bytes: &[u8], index: usize) -> u32 {
        let offset = index * 4;
        u32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ])
    }
    /// Parse the descriptor from the start of `bytes`.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let bytes = bytes.get(..Self::LEN)?;
        Some(Self {
            layout: MsduLayout::from_bits(Self::word(bytes, 0)),
            buffer_addr_low: Self::word(bytes, 1),
            position: MsduPosition::from_bits(Self::word(bytes, 2)),
            flags: MsduFlags::from_bits(Self::word(bytes, 3)),
            pn_low: Self::word(bytes, 4),
            security: MsduSecurity::from_bits(Self::word(bytes, 5)),
            reserved: Self::word(bytes, 6),
        })
    }
    /// Write the descriptor to the start of `bytes`.
    pub fn write(&self, bytes: &mut [u8]) -> Option<()> {
        let bytes = bytes.get_mut(..Self::LEN)?;
        let words = [
            self.layout.into_bits(),
            self.buffer_addr_low,
            self.position.into_bits(),
            self.flags.into_bits(),
            self.pn_low,
            self.security.into_bits(),
            self.reserved,
        ];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        Some(())
    }

    /// The interface (context) the frame was received on.
    pub fn interface(&self) -> u8 {
        self.layout.ctx_id()
    }
    pub fn station(&self) -> u8 {
        self.position.sta_lut_index()
    }
    pub fn tid(&self) -> u8 {
        self.flags.tid()
    }
    pub fn seq(&self) -> SeqNum {
        SeqNum::new(self.flags.seq_num())
    }
    pub fn frag_num(&self) -> u8 {
        self.security.frag_num()
    }
    pub fn more_frag(&self) -> bool {
        self.security.more_frag()
    }
    pub fn msdu_offset(&self) -> usize {
        self.layout.msdu_offset() as usize
    }
    pub fn msdu_len(&self) -> usize {
        self.layout.msdu_len() as usize
    }
    /// The length of descriptor, padding and MSDU.
    pub fn total_len(&self) -> usize {
        self.msdu_offset() + self.msdu_len()
    }
    /// The 48-bit packet number.
    pub fn pn(&self) -> u64 {
        ((self.security.pn_high() as u64) << 32) | self.pn_low as u64
    }
    pub fn cipher(&self) -> CipherType {
        CipherType::from_bits(self.security.cipher_type())
    }
    /// The number of header bytes, that are repeated in every fragment.
    pub fn link_header_len(&self) -> usize {
        if self.flags.snap_hdr_present() {
            ETH_HEADER_LEN
        } else {
            ETH_ADDRS_LEN
        }
    }
    /// Check if this is an unfragmented frame.
    pub fn is_unfragmented(&self) -> bool {
        self.frag_num() == 0 && !self.more_frag()
    }
    /// The per color credit carried by [HeadType::DataSpecial] frames.
    pub fn credit_flow(&self) -> [u8; 4] {
        self.reserved.to_le_bytes()
    }

    /// Check the write-done bit of a descriptor located at `offset` in `buffer`.
    pub fn write_done_at(buffer: &[u8], offset: usize) -> Option<bool> {
        let start = offset + Self::SECURITY_OFFSET;
        let word = buffer.get(start..start + 4)?;
        Some(MsduSecurity::from_bits(Self::word(word, 0)).data_write_done())
    }
    /// Set the write-done bit of a descriptor located at `offset` in `buffer`.
    pub fn set_write_done_at(buffer: &mut [u8], offset: usize, done: bool) -> Option<()> {
        let start = offset + Self::SECURITY_OFFSET;
        let word = buffer.get_mut(start..start + 4)?;
        let security = MsduSecurity::from_bits(Self::word(word, 0)).with_data_write_done(done);
        word.copy_from_slice(&security.into_bits().to_le_bytes());
        Some(())
    }
}

#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct TxCtrl {
    pub checksum_offload: bool,
    /// Set for TCP, clear for UDP.
    pub checksum_tcp: bool,
    pub sw_rate: bool,
    pub wds: bool,
    pub swq_flag: bool,
    #[bits(1)]
    pub __: u8,
    pub next_buffer_type: bool,
    pub pcie_mh_readcomp: bool,
}
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct TxBufferInfo {
    #[bits(4)]
    pub msdu_tid: u8,
    #[bits(4)]
    pub mac_data_offset: u8,
}
#[bitfield(u16)]
#[derive(PartialEq, Eq)]
pub struct TxColorSeq {
    /// The credit color the frame was admitted with.
    #[bits(2)]
    pub color: u8,
    pub seq_num: u8,
    #[bits(6)]
    pub __: u8,
}

/// The descriptor prepended to every transmitted MSDU.
///
/// The firmware reads it packed, so it's eleven bytes long and the multi-byte fields aren't
/// aligned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxMsduDesc {
    pub common: CommonHeader,
    /// Offset of the payload from the start of the descriptor.
    pub offset: u8,
    pub tx_ctrl: TxCtrl,
    /// Length of the payload, without this descriptor.
    pub pkt_len: u16,
    pub buffer_info: TxBufferInfo,
    pub sta_lut_index: u8,
    pub color_seq: TxColorSeq,
    pub tcp_udp_header_offset: u16,
}
impl TxMsduDesc {
    pub const LEN: usize = 11;
    pub fn new(interface: u8, color: u8, seq_num: u8, pkt_len: u16) -> Self {
        Self {
            common: CommonHeader::new()
                .with_head_type(HeadType::Data)
                .with_ctx_id(interface),
            offset: Self::LEN as u8,
            tx_ctrl: TxCtrl::new(),
            pkt_len,
            buffer_info: TxBufferInfo::new(),
            sta_lut_index: 0,
            color_seq: TxColorSeq::new().with_color(color).with_seq_num(seq_num),
            tcp_udp_header_offset: 0,
        }
    }
    pub fn color(&self) -> u8 {
        self.color_seq.color()
    }
    pub fn seq_num(&self) -> u8 {
        self.color_seq.seq_num()
    }
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let bytes = bytes.get(..Self::LEN)?;
        Some(Self {
            common: CommonHeader::from_bits(bytes[0]),
            offset: bytes[1],
            tx_ctrl: TxCtrl::from_bits(bytes[2]),
            pkt_len: u16::from_le_bytes([bytes[3], bytes[4]]),
            buffer_info: TxBufferInfo::from_bits(bytes[5]),
            sta_lut_index: bytes[6],
            color_seq: TxColorSeq::from_bits(u16::from_le_bytes([bytes[7], bytes[8]])),
            tcp_udp_header_offset: u16::from_le_bytes([bytes[9], bytes[10]]),
        })
    }
    pub fn write(&self, bytes: &mut [u8]) -> Option<()> {
        let bytes = bytes.get_mut(..Self::LEN)?;
        bytes[0] = self.common.into_bits();
        bytes[1] = self.offset;
        bytes[2] = self.tx_ctrl.into_bits();
        bytes[3..5].copy_from_slice(&self.pkt_len.to_le_bytes());
        bytes[5] = self.buffer_info.into_bits();
        bytes[6] = self.sta_lut_index;
        bytes[7..9].copy_from_slice(&self.color_seq.into_bits().to_le_bytes());
        bytes[9..11].copy_from_slice(&self.tcp_udp_header_offset.to_le_bytes());
        Some(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msdu_desc_bit_positions() {
        let mut bytes = [0u8; RxMsduDesc::LEN];
        // W0: host_type 2, ctx_id 1, offset 28, len 300.
        bytes[0..4].copy_from_slice(&(2u32 | (1 << 4) | (28 << 8) | (300 << 16)).to_le_bytes());
        // W2: sta_lut_index 5 in the top five bits.
        bytes[8..12].copy_from_slice(&(5u32 << 27).to_le_bytes());
        // W3: qos, tid 6, seq 4095.
        bytes[12..16]
            .copy_from_slice(&((1 << 13) | (6 << 16) | (0xfffu32 << 20)).to_le_bytes());
        // W5: frag 2, more_frag, cipher CCMP, write done.
        bytes[20..24].copy_from_slice(
            &((2 << 16) | (1 << 20) | (2 << 24) | (1u32 << 31)).to_le_bytes(),
        );
        let desc = RxMsduDesc::parse(&bytes).unwrap();
        assert_eq!(desc.interface(), 1);
        assert_eq!(desc.msdu_offset(), 28);
        assert_eq!(desc.msdu_len(), 300);
        assert_eq!(desc.station(), 5);
        assert!(desc.flags.qos());
        assert_eq!(desc.tid(), 6);
        assert_eq!(desc.seq().value(), 4095);
        assert_eq!(desc.frag_num(), 2);
        assert!(desc.more_frag());
        assert_eq!(desc.cipher(), CipherType::Ccmp);
        assert!(desc.security.data_write_done());

        let mut written = [0u8; RxMsduDesc::LEN];
        desc.write(&mut written).unwrap();
        assert_eq!(written, bytes);
    }

    #[test]
    fn write_done_in_place() {
        let mut buffer = [0u8; RX_MH_DESC_LEN + RxMsduDesc::LEN];
        RxMsduDesc::set_write_done_at(&mut buffer, RX_MH_DESC_LEN, true).unwrap();
        assert_eq!(buffer[RX_MH_DESC_LEN + 23], 0x80);
        assert_eq!(
            RxMsduDesc::write_done_at(&buffer, RX_MH_DESC_LEN),
            Some(true)
        );
        RxMsduDesc::set_write_done_at(&mut buffer, RX_MH_DESC_LEN, false).unwrap();
        assert_eq!(
            RxMsduDesc::write_done_at(&buffer, RX_MH_DESC_LEN),
            Some(false)
        );
        assert_eq!(RxMsduDesc::write_done_at(&buffer[..30], RX_MH_DESC_LEN), None);
    }

    #[test]
    fn mh_checksum_words() {
        let mut buffer = [0u8; RX_MH_DESC_LEN];
        // W0 is the next MSDU pointer and must not be mistaken for the checksum.
        buffer[0..4].copy_from_slice(&0x8000_1234u32.to_le_bytes());
        assert_eq!(mh_checksum(&buffer), None);

        // W2: tcp_checksum_en at bit 28. W3: checksum in the low half.
        buffer[8..12].copy_from_slice(&(1u32 << 28).to_le_bytes());
        buffer[12..16].copy_from_slice(&(0xbeefu32 | (1 << 16)).to_le_bytes());
        assert_eq!(mh_checksum(&buffer), Some(0xbeef));
        assert_eq!(mh_checksum(&buffer[..12]), None);
    }

    #[test]
    fn common_header_layout() {
        let header = CommonHeader::new()
            .with_head_type(HeadType::DataPcieAddr)
            .with_reserved(true);
        assert_eq!(header.into_bits(), 0b0000_1100);
        let header = CommonHeader::from_bits(0b1010_0010);
        assert_eq!(header.head_type(), HeadType::Data);
        assert!(!header.rsp());
        assert_eq!(header.ctx_id(), 5);
    }

    #[test]
    fn pn_combines_both_words() {
        let desc = RxMsduDesc {
            pn_low: 0xdead_beef,
            security: MsduSecurity::new().with_pn_high(0x1234),
            ..Default::default()
        };
        assert_eq!(desc.pn(), 0x1234_dead_beef);
    }

    #[test]
    fn tx_desc_packed_layout() {
        let desc = TxMsduDesc::new(2, 3, 17, 1500);
        let mut bytes = [0u8; TxMsduDesc::LEN];
        desc.write(&mut bytes).unwrap();
        // Common header: type DATA, ctx 2. Offset 11. pkt_len at bytes 3-4.
        // Color 3 and seq 17 share the little endian half word at bytes 7-8.
        assert_eq!(
            bytes,
            [0x42, 11, 0, 0xdc, 0x05, 0, 0, 0x47, 0x00, 0, 0]
        );
        let parsed = TxMsduDesc::parse(&bytes).unwrap();
        assert_eq!(parsed, desc);
        assert_eq!(parsed.color(), 3);
        assert_eq!(parsed.seq_num(), 17);
        assert_eq!(parsed.common.ctx_id(), 2);
        assert_eq!(parsed.common.head_type(), HeadType::Data);
        assert_eq!(parsed.pkt_len, 1500);
        assert_eq!(TxMsduDesc::parse(&bytes[..10]), None);
    }
}
