//! Line-address decoding.
//!
//! A 64-bit line address is projected onto the device coordinates
//! (channel, sub-channel, rank, bank group, bank, row, column) by one of two
//! fixed bit layouts. Field widths are `log2` of the configured counts; the
//! mapper assumes a validated configuration and does no checking per call.

use crate::config::{DramConfig, MappingKind};

/// Device coordinates of one line address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DecodedAddress {
    pub channel: u64,
    pub subchannel: u64,
    pub rank: u64,
    pub bankgroup: u64,
    pub bank: u64,
    pub row: u64,
    pub column: u64,
}

#[inline]
const fn mask(bits: u32) -> u64 {
    (1u64 << bits) - 1
}

/// Fixed projection from line addresses to device coordinates.
///
/// Layouts, low bit to high bit:
/// - `Linear`: channel, sub-channel, bank group, bank, rank, column, row.
/// - `Mop(n)`: n low column bits, sub-channel, channel, bank group, bank,
///   rank, remaining column bits, row. Adjacent lines land on alternating
///   sub-channels and banks instead of walking one row buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressMapper {
    kind: MappingKind,
    b_ch: u32,
    b_sc: u32,
    b_ra: u32,
    b_bg: u32,
    b_ba: u32,
    b_ro: u32,
    b_co: u32,

    ch_off: u32,
    sc_off: u32,
    ra_off: u32,
    bg_off: u32,
    ba_off: u32,
    ro_off: u32,
    /// Linear: offset of the whole column field. MOP: offset of the high
    /// column bits (the low `n` sit at bit 0).
    co_off: u32,
}

impl AddressMapper {
    pub fn new(conf: &DramConfig) -> Self {
        let b_ch = conf.channels.trailing_zeros();
        let b_sc = conf.subchannels.trailing_zeros();
        let b_ra = conf.ranks.trailing_zeros();
        let b_bg = conf.bankgroups.trailing_zeros();
        let b_ba = conf.banks.trailing_zeros();
        let b_ro = conf.rows.trailing_zeros();
        let b_co = conf.columns.trailing_zeros();

        let mut m = Self {
            kind: conf.mapping,
            b_ch,
            b_sc,
            b_ra,
            b_bg,
            b_ba,
            b_ro,
            b_co,
            ch_off: 0,
            sc_off: 0,
            ra_off: 0,
            bg_off: 0,
            ba_off: 0,
            ro_off: 0,
            co_off: 0,
        };
        match conf.mapping {
            MappingKind::Linear => {
                m.ch_off = 0;
                m.sc_off = m.ch_off + b_ch;
                m.bg_off = m.sc_off + b_sc;
                m.ba_off = m.bg_off + b_bg;
                m.ra_off = m.ba_off + b_ba;
                m.co_off = m.ra_off + b_ra;
                m.ro_off = m.co_off + b_co;
            }
            MappingKind::Mop(n) => {
                m.sc_off = n;
                m.ch_off = m.sc_off + b_sc;
                m.bg_off = m.ch_off + b_ch;
                m.ba_off = m.bg_off + b_bg;
                m.ra_off = m.ba_off + b_ba;
                m.co_off = m.ra_off + b_ra;
                m.ro_off = m.co_off + (b_co - n);
            }
        }
        m
    }

    /// Total significant bits; higher bits of a line address are ignored.
    pub fn significant_bits(&self) -> u32 {
        self.b_ch + self.b_sc + self.b_ra + self.b_bg + self.b_ba + self.b_ro + self.b_co
    }

    pub fn decode(&self, lineaddr: u64) -> DecodedAddress {
        let column = match self.kind {
            MappingKind::Linear => (lineaddr >> self.co_off) & mask(self.b_co),
            MappingKind::Mop(n) => {
                let low = lineaddr & mask(n);
                let high = (lineaddr >> self.co_off) & mask(self.b_co - n);
                low | (high << n)
            }
        };
        DecodedAddress {
            channel: (lineaddr >> self.ch_off) & mask(self.b_ch),
            subchannel: (lineaddr >> self.sc_off) & mask(self.b_sc),
            rank: (lineaddr >> self.ra_off) & mask(self.b_ra),
            bankgroup: (lineaddr >> self.bg_off) & mask(self.b_bg),
            bank: (lineaddr >> self.ba_off) & mask(self.b_ba),
            row: (lineaddr >> self.ro_off) & mask(self.b_ro),
            column,
        }
    }

    /// Inverse of `decode` over the significant bits.
    pub fn encode(&self, d: &DecodedAddress) -> u64 {
        let mut x = (d.channel << self.ch_off)
            | (d.subchannel << self.sc_off)
            | (d.rank << self.ra_off)
            | (d.bankgroup << self.bg_off)
            | (d.bank << self.ba_off)
            | (d.row << self.ro_off);
        match self.kind {
            MappingKind::Linear => x |= d.column << self.co_off,
            MappingKind::Mop(n) => {
                x |= d.column & mask(n);
                x |= (d.column >> n) << self.co_off;
            }
        }
        x
    }

    /// Row bits of `lineaddr`, without building the full decode.
    #[inline]
    pub fn row_of(&self, lineaddr: u64) -> u64 {
        (lineaddr >> self.ro_off) & mask(self.b_ro)
    }

    /// Rank bits of `lineaddr`.
    #[inline]
    pub fn rank_of(&self, lineaddr: u64) -> u64 {
        (lineaddr >> self.ra_off) & mask(self.b_ra)
    }

    /// (bank group, bank) of `lineaddr`.
    #[inline]
    pub fn bank_of(&self, lineaddr: u64) -> (u64, u64) {
        (
            (lineaddr >> self.bg_off) & mask(self.b_bg),
            (lineaddr >> self.ba_off) & mask(self.b_ba),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DramConfig;
    use proptest::prelude::*;

    fn config_with(mapping: MappingKind) -> DramConfig {
        DramConfig {
            mapping,
            ..DramConfig::default()
        }
    }

    #[test]
    fn linear_fields_unpack_in_order() {
        // Default topology: ch takes 0 bits, sc bit 0, bg bits 1-3,
        // ba bits 4-5, ra bit 6, co bits 7-17, ro bits 18+.
        let m = AddressMapper::new(&config_with(MappingKind::Linear));
        let addr = 1 | (3 << 1) | (2 << 4) | (1 << 6) | (5 << 7) | (9 << 18);
        let d = m.decode(addr);
        assert_eq!(d.channel, 0);
        assert_eq!(d.subchannel, 1);
        assert_eq!(d.bankgroup, 3);
        assert_eq!(d.bank, 2);
        assert_eq!(d.rank, 1);
        assert_eq!(d.column, 5);
        assert_eq!(d.row, 9);
    }

    #[test]
    fn mop_interleaves_adjacent_lines() {
        let m = AddressMapper::new(&config_with(MappingKind::Mop(2)));
        let base = m.decode(0);
        let next = m.decode(1);
        // Lines 0..4 differ only in the low column bits.
        assert_eq!(base.subchannel, next.subchannel);
        assert_eq!(next.column, 1);
        // Line 4 crosses into the next sub-channel.
        let hop = m.decode(4);
        assert_eq!(hop.subchannel, 1);
        assert_eq!(hop.column, 0);
    }

    #[test]
    fn encode_inverts_decode_fixed() {
        for mapping in [MappingKind::Linear, MappingKind::Mop(2)] {
            let m = AddressMapper::new(&config_with(mapping));
            for addr in [0u64, 1, 0xdead_beef, 0x0123_4567_89ab] {
                let masked = addr & ((1u64 << m.significant_bits()) - 1);
                assert_eq!(m.encode(&m.decode(masked)), masked, "{mapping:?}");
            }
        }
    }

    proptest! {
        #[test]
        fn roundtrip_over_significant_bits(addr in any::<u64>()) {
            for mapping in [MappingKind::Linear, MappingKind::Mop(2)] {
                let m = AddressMapper::new(&config_with(mapping));
                let masked = addr & ((1u64 << m.significant_bits()) - 1);
                prop_assert_eq!(m.encode(&m.decode(masked)), masked);
            }
        }
    }
}
