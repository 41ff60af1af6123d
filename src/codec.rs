//! Bit layout of the per-slot info words kept in every erase unit header.
//!
//! Each word is a little-endian `u32`:
//!
//! | bits    | meaning                                          |
//! |---------|--------------------------------------------------|
//! | 28..=31 | type tag                                         |
//! | 20..=27 | sideband byte (unit record, words 0..16 only)    |
//! | 19      | unwritten marker, cleared on first program       |
//! | 0..=18  | payload: sector, logical address or segment      |
//!
//! Flash programming can only clear bits, so every retag is chosen to be a
//! bit subset of the tag it replaces and is written with all-ones in the
//! fields it must leave untouched.

use crate::config::{INFO_WORD_SIZE, MAGIC_1, MAGIC_2, RECORD_WORDS};

pub const TAG_SHIFT: u32 = 28;
pub const SIDEBAND_SHIFT: u32 = 20;
pub const SIDEBAND_MASK: u32 = 0xFF << SIDEBAND_SHIFT;
pub const UNWRITTEN_BIT: u32 = 1 << 19;
pub const PAYLOAD_MASK: u32 = UNWRITTEN_BIT - 1;
pub const ERASED_WORD: u32 = u32::MAX;
pub const RECORD_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Kind {
    Deleted = 0x0,
    Victim = 0x1,
    Erase = 0x3,
    Reclaim = 0x7,
    DataDeleted = 0x8,
    Xlate = 0x9,
    XlateSecondary = 0xB,
    DataCommitted = 0xC,
    DataWritten = 0xE,
    Reserved = 0xF,
}

impl Kind {
    fn from_tag(tag: u8) -> Option<Kind> {
        Some(match tag {
            0x0 => Kind::Deleted,
            0x1 => Kind::Victim,
            0x3 => Kind::Erase,
            0x7 => Kind::Reclaim,
            0x8 => Kind::DataDeleted,
            0x9 => Kind::Xlate,
            0xB => Kind::XlateSecondary,
            0xC => Kind::DataCommitted,
            0xE => Kind::DataWritten,
            0xF => Kind::Reserved,
            _ => return None,
        })
    }

    /// Slot no longer holds anything a reclaim has to carry over.
    pub fn is_dead(self) -> bool {
        matches!(self, Kind::Deleted | Kind::DataDeleted | Kind::Reserved)
    }

    /// Whether programming `next` over `self` only clears bits.
    pub fn can_become(self, next: Kind) -> bool {
        (self as u8) & (next as u8) == next as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Info {
    pub kind: Kind,
    pub payload: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    Unwritten,
    Entry(Info),
    Unknown(u8),
}

impl Info {
    pub fn new(kind: Kind, payload: u32) -> Self {
        debug_assert!(payload <= PAYLOAD_MASK, "payload {payload:#x} overflows");
        Info { kind, payload }
    }

    /// Word to program; sideband bits stay ones so they survive the AND.
    pub fn encode(self) -> u32 {
        ((self.kind as u32) << TAG_SHIFT) | SIDEBAND_MASK | (self.payload & PAYLOAD_MASK)
    }

    pub fn decode(word: u32) -> Decoded {
        if word & UNWRITTEN_BIT != 0 {
            return Decoded::Unwritten;
        }
        let tag = (word >> TAG_SHIFT) as u8;
        match Kind::from_tag(tag) {
            Some(kind) => Decoded::Entry(Info { kind, payload: word & PAYLOAD_MASK }),
            None => Decoded::Unknown(tag),
        }
    }
}

/// Strips the sideband byte so a copied word cannot clobber a record.
pub fn without_sideband(word: u32) -> u32 {
    word | SIDEBAND_MASK
}

pub fn words_from_bytes(bytes: &[u8]) -> impl Iterator<Item = u32> + '_ {
    bytes
        .chunks_exact(INFO_WORD_SIZE)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
}

/// Slot-0 description of an erase unit together with its sideband record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitHeader {
    pub kind: Kind,
    pub sector: u32,
    pub erase_count: u32,
    /// Only meaningful on a `Victim`; erased (`u32::MAX`) otherwise.
    pub reclaim_erase_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderState {
    /// Slot 0 and the record never programmed since the last erase.
    Blank,
    Valid(UnitHeader),
    Corrupt(&'static str),
}

impl UnitHeader {
    pub fn new(kind: Kind, sector: u32, erase_count: u32) -> Self {
        UnitHeader { kind, sector, erase_count, reclaim_erase_count: u32::MAX }
    }

    pub fn record(&self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        out[0..4].copy_from_slice(&self.erase_count.to_le_bytes());
        out[4..8].copy_from_slice(&self.reclaim_erase_count.to_le_bytes());
        out[8..12].copy_from_slice(&MAGIC_1.to_le_bytes());
        out[12..16].copy_from_slice(&MAGIC_2.to_le_bytes());
        out
    }

    /// First `RECORD_WORDS` header words, record byte `i` in word `i`.
    pub fn encode(&self) -> [u8; RECORD_WORDS * INFO_WORD_SIZE] {
        let record = self.record();
        let mut out = [0u8; RECORD_WORDS * INFO_WORD_SIZE];
        for (i, byte) in record.iter().enumerate() {
            let base = if i == 0 {
                Info::new(self.kind, self.sector).encode()
            } else {
                ERASED_WORD
            };
            let word = (base & !SIDEBAND_MASK) | ((*byte as u32) << SIDEBAND_SHIFT);
            out[i * INFO_WORD_SIZE..(i + 1) * INFO_WORD_SIZE].copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> HeaderState {
        let words: Vec<u32> = words_from_bytes(&bytes[..RECORD_WORDS * INFO_WORD_SIZE]).collect();
        let mut record = [0u8; RECORD_SIZE];
        for (i, word) in words.iter().enumerate() {
            record[i] = ((word & SIDEBAND_MASK) >> SIDEBAND_SHIFT) as u8;
        }
        let field = |i: usize| u32::from_le_bytes([record[i], record[i + 1], record[i + 2], record[i + 3]]);

        let info = match Info::decode(words[0]) {
            Decoded::Unwritten => {
                return if record.iter().all(|b| *b == 0xFF) {
                    HeaderState::Blank
                } else {
                    HeaderState::Corrupt("unit record without a unit tag")
                };
            }
            Decoded::Unknown(_) => return HeaderState::Corrupt("unknown unit tag"),
            Decoded::Entry(info) => info,
        };
        if field(8) != MAGIC_1 || field(12) != MAGIC_2 {
            return HeaderState::Corrupt("bad magic");
        }
        if !matches!(info.kind, Kind::Erase | Kind::Victim | Kind::Reclaim) {
            return HeaderState::Corrupt("slot 0 is not a unit tag");
        }
        HeaderState::Valid(UnitHeader {
            kind: info.kind,
            sector: info.payload,
            erase_count: field(0),
            reclaim_erase_count: field(4),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn info_word_layout() {
        let word = Info::new(Kind::DataCommitted, 0x1234).encode();
        assert_eq!(word, 0xCFF0_1234);
        assert_eq!(word.to_le_bytes(), [0x34, 0x12, 0xF0, 0xCF]);
        assert_eq!(Info::new(Kind::Reserved, 0).encode(), 0xFFF0_0000);
        assert_eq!(Info::new(Kind::Deleted, 0x7FFFF).encode(), 0x0FF7_FFFF);
    }

    #[test]
    fn erased_word_is_unwritten() {
        assert_eq!(Info::decode(ERASED_WORD), Decoded::Unwritten);
        assert_eq!(Info::decode(0x2FF0_0001), Decoded::Unknown(0x2));
        assert_eq!(
            Info::decode(0xBFF0_0003),
            Decoded::Entry(Info { kind: Kind::XlateSecondary, payload: 3 })
        );
    }

    #[test]
    fn lifecycles_only_clear_bits() {
        use Kind::*;
        let allowed = [
            (Reserved, DataWritten),
            (DataWritten, DataCommitted),
            (DataCommitted, DataDeleted),
            (DataCommitted, Deleted),
            (DataDeleted, Deleted),
            (Reserved, Deleted),
            (Reserved, Xlate),
            (Reserved, XlateSecondary),
            (XlateSecondary, Xlate),
            (Xlate, Deleted),
            (XlateSecondary, Deleted),
            (Reclaim, Erase),
            (Erase, Victim),
        ];
        for (from, to) in allowed {
            assert!(from.can_become(to), "{from:?} -> {to:?}");
            let programmed = Info::new(from, 42).encode() & Info::new(to, 42).encode();
            assert_eq!(Info::decode(programmed), Decoded::Entry(Info::new(to, 42)));
        }
        assert!(!Xlate.can_become(XlateSecondary));
        assert!(!Victim.can_become(Erase));
    }

    #[test]
    fn header_record_bytes() {
        let header = UnitHeader::new(Kind::Erase, 5, 1);
        let bytes = header.encode();
        assert_eq!(&bytes[0..4], &0x3010_0005u32.to_le_bytes());
        // erase count byte 1 and the first magic byte
        assert_eq!(&bytes[4..8], &0xF00F_FFFFu32.to_le_bytes());
        assert_eq!(&bytes[32..36], &(0xF00F_FFFFu32 | (0x46 << 20)).to_le_bytes());
        // reclaim erase count stays erased
        assert_eq!(&bytes[16..20], &ERASED_WORD.to_le_bytes());
        assert_eq!(UnitHeader::decode(&bytes), HeaderState::Valid(header));
    }

    #[test]
    fn victim_marking_preserves_record() {
        let spare = UnitHeader::new(Kind::Erase, 2, 9);
        let victim = UnitHeader { kind: Kind::Victim, reclaim_erase_count: 14, ..spare };
        let mut media = spare.encode();
        // a data slot tag already sits in word 3
        let slot3 = Info::new(Kind::DataCommitted, 77).encode();
        let old3 = u32::from_le_bytes(media[12..16].try_into().unwrap());
        media[12..16].copy_from_slice(&(old3 & slot3).to_le_bytes());

        for (dst, src) in media.iter_mut().zip(victim.encode().iter()) {
            *dst &= *src;
        }
        assert_eq!(UnitHeader::decode(&media), HeaderState::Valid(victim));
        let word3 = u32::from_le_bytes(media[12..16].try_into().unwrap());
        assert_eq!(Info::decode(word3), Decoded::Entry(Info::new(Kind::DataCommitted, 77)));
    }

    #[test]
    fn blank_and_corrupt_headers() {
        let blank = [0xFFu8; 64];
        assert_eq!(UnitHeader::decode(&blank), HeaderState::Blank);

        let mut bad = UnitHeader::new(Kind::Erase, 0, 1).encode();
        bad[47] &= 0xF0; // clobber the high sideband nibble of a magic byte
        assert!(matches!(UnitHeader::decode(&bad), HeaderState::Corrupt(_)));

        let mut data_tag = [0xFFu8; 64];
        data_tag[0..4].copy_from_slice(&Info::new(Kind::DataCommitted, 1).encode().to_le_bytes());
        assert!(matches!(UnitHeader::decode(&data_tag), HeaderState::Corrupt(_)));
    }
}
