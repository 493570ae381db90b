use bincode::{DefaultOptions, Options};
use serde::{Deserialize, Serialize};

use crate::error::FtlErr;
use super::SEC_OFFSET_INVALID;

// Every page's spare area carries a common prefix {sector type, erase count}
// and a type-specific tail, all fixed-size little-endian. The erase count is
// meaningful only at physical sector offset 0 of a block; everywhere else
// the field holds ERASE_CNT_INVALID.
//
// The trailing used mark is all-zeros, 2 x ECC-strength bytes wide. Erase
// yields all-ones, so a majority of zero bits identifies "written" even when
// the payload is unreadable.

/// Fixed offset of the used mark inside the usable OOS area.
pub const OOS_USED_MARK_OFF: u32 = 16;

/// Usable OOS bytes the layer requires for a given ECC strength.
pub fn oos_partial_size(ecc_strength: u32) -> u32
{
    OOS_USED_MARK_OFF + 2 * ecc_strength
}

/// The bincode configuration shared by every persisted structure.
pub fn bincode_opt() -> impl Options + Copy
{
    DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
}


/// Sector type tag, the first OOS byte.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SecType {
    Storage,
    Metadata,
    Header,
}

impl SecType {
    pub fn as_raw(self) -> u8
    {
        match self {
            Self::Storage => 0x01,
            Self::Metadata => 0x02,
            Self::Header => 0x03,
        }
    }

    pub fn from_raw(raw: u8) -> Option<Self>
    {
        match raw {
            0x01 => Some(Self::Storage),
            0x02 => Some(Self::Metadata),
            0x03 => Some(Self::Header),
            _ => None,
        }
    }
}


/// Sequencing tag of a metadata sector.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SeqStatus {
    /// First sector of a multi-sector commit.
    New,
    /// Intermediate sector of a commit.
    Unfinished,
    /// Stand-alone commit of the available-block table sector.
    AvailOnly,
    /// Terminal sector of a committed sequence.
    Finished,
}

impl SeqStatus {
    pub fn as_raw(self) -> u8
    {
        match self {
            Self::New => 0x01,
            Self::Unfinished => 0x02,
            Self::AvailOnly => 0x03,
            Self::Finished => 0x04,
        }
    }

    pub fn from_raw(raw: u8) -> Option<Self>
    {
        match raw {
            0x01 => Some(Self::New),
            0x02 => Some(Self::Unfinished),
            0x03 => Some(Self::AvailOnly),
            0x04 => Some(Self::Finished),
            _ => None,
        }
    }
}


/// OOS image of a storage sector.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageOos {
    pub sec_type: u8,
    pub erase_cnt: u32,
    pub blk_ix_logical: u32,
    pub sec_offset_logical: u32, // SEC_OFFSET_INVALID marks a dummy sector
}

impl StorageOos {
    pub fn new(erase_cnt: u32, blk_ix_logical: u32, sec_offset_logical: u32) -> Self
    {
        Self {
            sec_type: SecType::Storage.as_raw(),
            erase_cnt,
            blk_ix_logical,
            sec_offset_logical,
        }
    }

    /// A dummy sector carries only an erase count.
    pub fn dummy(erase_cnt: u32, blk_ix_logical: u32) -> Self
    {
        Self::new(erase_cnt, blk_ix_logical, SEC_OFFSET_INVALID)
    }

    pub fn is_dummy(&self) -> bool
    {
        self.sec_offset_logical == SEC_OFFSET_INVALID
    }
}


/// OOS image of a metadata sector.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetaOos {
    pub sec_type: u8,
    pub erase_cnt: u32,
    pub meta_sec_ix: u32,
    pub meta_blk_id: u32,
    pub seq_status: u8,
}

impl MetaOos {
    pub fn new(erase_cnt: u32, meta_sec_ix: u32, meta_blk_id: u32, status: SeqStatus) -> Self
    {
        Self {
            sec_type: SecType::Metadata.as_raw(),
            erase_cnt,
            meta_sec_ix,
            meta_blk_id,
            seq_status: status.as_raw(),
        }
    }
}


pub fn sec_type_of(oos: &[u8]) -> Option<SecType>
{
    SecType::from_raw(oos[0])
}

/// The erase count field, at a fixed position right after the type byte.
pub fn erase_cnt_of(oos: &[u8]) -> u32
{
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&oos[1..5]);

    u32::from_le_bytes(raw)
}

pub fn erase_cnt_set(oos: &mut [u8], erase_cnt: u32)
{
    oos[1..5].copy_from_slice(&erase_cnt.to_le_bytes());
}

pub fn used_mark_wr(oos: &mut [u8], ecc_strength: u32)
{
    let off = OOS_USED_MARK_OFF as usize;
    let len = 2 * ecc_strength as usize;

    for b in oos[off..off + len].iter_mut() {
        *b = 0x00;
    }
}

/// A sector counts as used when at least half of the mark's bits read zero.
pub fn used_mark_is_set(mark: &[u8]) -> bool
{
    let total = mark.len() * 8;
    let zeros: usize = mark.iter().map(|b| b.count_zeros() as usize).sum();

    zeros * 2 >= total
}

/// Serializes a storage OOS and stamps the used mark.
pub fn storage_oos_wr(oos: &mut [u8], img: &StorageOos, ecc_strength: u32)
    -> Result<(), FtlErr>
{
    bincode_opt()
        .serialize_into(&mut oos[..], img)
        .map_err(|_| FtlErr::InvalidMetadata)?;
    used_mark_wr(oos, ecc_strength);

    Ok(())
}

pub fn storage_oos_rd(oos: &[u8]) -> Result<StorageOos, FtlErr>
{
    if sec_type_of(oos) != Some(SecType::Storage) {
        return Err(FtlErr::InvalidMetadata);
    }

    bincode_opt()
        .deserialize(oos)
        .map_err(|_| FtlErr::InvalidMetadata)
}

/// Serializes a metadata OOS and stamps the used mark.
pub fn meta_oos_wr(oos: &mut [u8], img: &MetaOos, ecc_strength: u32)
    -> Result<(), FtlErr>
{
    bincode_opt()
        .serialize_into(&mut oos[..], img)
        .map_err(|_| FtlErr::InvalidMetadata)?;
    used_mark_wr(oos, ecc_strength);

    Ok(())
}

pub fn meta_oos_rd(oos: &[u8]) -> Result<MetaOos, FtlErr>
{
    if sec_type_of(oos) != Some(SecType::Metadata) {
        return Err(FtlErr::InvalidMetadata);
    }

    bincode_opt()
        .deserialize(oos)
        .map_err(|_| FtlErr::InvalidMetadata)
}

/// Serializes a header OOS (common prefix only) and stamps the used mark.
pub fn hdr_oos_wr(oos: &mut [u8], erase_cnt: u32, ecc_strength: u32)
{
    oos[0] = SecType::Header.as_raw();
    erase_cnt_set(oos, erase_cnt);
    used_mark_wr(oos, ecc_strength);
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftl::ERASE_CNT_INVALID;

    #[test]
    fn storage_roundtrip()
    {
        let mut buf = vec![0xffu8; 24];
        let img = StorageOos::new(17, 42, 5);

        storage_oos_wr(&mut buf, &img, 2).unwrap();

        assert_eq!(sec_type_of(&buf), Some(SecType::Storage));
        assert_eq!(erase_cnt_of(&buf), 17);
        assert_eq!(storage_oos_rd(&buf).unwrap(), img);

        let mark = &buf[OOS_USED_MARK_OFF as usize..OOS_USED_MARK_OFF as usize + 4];
        assert!(used_mark_is_set(mark));
    }

    #[test]
    fn meta_roundtrip()
    {
        let mut buf = vec![0xffu8; 24];
        let img = MetaOos::new(3, 1, 0x8000_0001, SeqStatus::Finished);

        meta_oos_wr(&mut buf, &img, 2).unwrap();

        assert_eq!(sec_type_of(&buf), Some(SecType::Metadata));
        let back = meta_oos_rd(&buf).unwrap();
        assert_eq!(back, img);
        assert_eq!(SeqStatus::from_raw(back.seq_status), Some(SeqStatus::Finished));
    }

    #[test]
    fn erased_oos_is_unrecognized()
    {
        let buf = vec![0xffu8; 24];

        assert_eq!(sec_type_of(&buf), None);
        assert!(!used_mark_is_set(&buf[16..20]));
        assert!(storage_oos_rd(&buf).is_err());
    }

    #[test]
    fn used_mark_majority()
    {
        // Half the bits stuck at one still reads as used.
        assert!(used_mark_is_set(&[0x00, 0xff]));
        assert!(used_mark_is_set(&[0x0f, 0x0f]));
        assert!(!used_mark_is_set(&[0xff, 0xfe]));
    }

    #[test]
    fn dummy_mark()
    {
        let img = StorageOos::dummy(9, 3);

        assert!(img.is_dummy());
        assert_eq!(img.erase_cnt, 9);
        assert_ne!(img.erase_cnt, ERASE_CNT_INVALID);
    }

    #[test]
    fn erase_cnt_patch()
    {
        let mut buf = vec![0xffu8; 24];
        let img = StorageOos::new(4, 1, 0);
        storage_oos_wr(&mut buf, &img, 2).unwrap();

        erase_cnt_set(&mut buf, 11);
        assert_eq!(erase_cnt_of(&buf), 11);
        assert_eq!(storage_oos_rd(&buf).unwrap().erase_cnt, 11);
    }
}
