use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::error::FtlErr;
use crate::nand::{blk_is_factory_defect, Ctrlr};
use super::NandDev;
use super::oos::{self, bincode_opt, SecType};

pub const HDR_MARKER_1: u32 = 0x4654_4c31; // "1LTF"
pub const HDR_MARKER_2: u32 = 0x444e_414e; // "NAND"
pub const HDR_VERSION: u16 = 0x0001;

/// On-device header payload: pins the low-level parameters the translation
/// layer was formatted with. Checked field-for-field on every mount.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HdrParams {
    pub marker_1: u32,
    pub marker_2: u32,
    pub version: u16,
    pub sec_size: u32,
    pub blk_cnt: u32,
    pub first_blk_ix: u32,
    pub ub_cnt_max: u32,
    pub rub_max_assoc: u32,
    pub avail_blk_tbl_cnt_max: u32,
    pub oos_partial_size: u32,
    pub max_bad_blk_cnt: u32,
}

impl<C: Ctrlr> NandDev<C> {
    /// The header this device would write, from its current configuration.
    pub fn hdr_expected_params(&self) -> HdrParams
    {
        HdrParams {
            marker_1: HDR_MARKER_1,
            marker_2: HDR_MARKER_2,
            version: HDR_VERSION,
            sec_size: self.sec_size,
            blk_cnt: self.blk_cnt,
            first_blk_ix: 0,
            ub_cnt_max: self.ub_cnt,
            rub_max_assoc: self.k_max,
            avail_blk_tbl_cnt_max: self.avail_cnt,
            oos_partial_size: oos::oos_partial_size(self.ecc_strength),
            max_bad_blk_cnt: self.max_bad,
        }
    }

    /// Writes the header into the first block that passes the factory-defect
    /// check. Blocks that fail the erase or the program are skipped; they
    /// will be caught by the format scan that follows.
    pub fn hdr_wr(&mut self) -> Result<u32, FtlErr>
    {
        let params = self.hdr_expected_params();

        for blk in 0..self.blk_cnt {
            if blk_is_factory_defect(&mut self.ctrlr, blk, self.sec_size, self.secs_per_pg)? {
                continue;
            }

            if self.ctrlr.blk_erase(blk).is_err() {
                continue;
            }

            let mut data = vec![0u8; self.sec_size as usize];
            bincode_opt()
                .serialize_into(&mut data[..], &params)
                .map_err(|_| FtlErr::InvalidMetadata)?;

            let mut oos_buf = vec![0xffu8; self.oos_size as usize];
            // No prior history: the header block starts at erase count 1.
            oos::hdr_oos_wr(&mut oos_buf, 1, self.ecc_strength);

            let sec = blk as u64 * self.spb as u64;
            if self.ctrlr.sec_wr(&data, &oos_buf, sec).is_err() {
                continue;
            }

            self.hdr_blk_ix = blk;
            self.logger.log(1, &format!("header written at block {}", blk));

            return Ok(blk);
        }

        Err(FtlErr::NoAvailBlk)
    }

    /// Scans for the header block and validates its parameters against the
    /// current configuration. ECC errors during the scan are ignored; a
    /// factory defect marker may live in the same region.
    pub fn hdr_find(&mut self) -> Result<(u32, HdrParams), FtlErr>
    {
        let mut data = vec![0u8; self.sec_size as usize];
        let mut oos_buf = vec![0u8; self.oos_size as usize];

        for blk in 0..self.blk_cnt {
            let sec = blk as u64 * self.spb as u64;
            let _ = self.ctrlr.sec_rd(&mut data, &mut oos_buf, sec)?;

            if oos::sec_type_of(&oos_buf) != Some(SecType::Header) {
                continue;
            }

            let params: HdrParams = bincode_opt()
                .deserialize(&data[..])
                .map_err(|_| FtlErr::InvalidLowFmt)?;

            if params.marker_1 != HDR_MARKER_1 || params.marker_2 != HDR_MARKER_2 {
                return Err(FtlErr::InvalidLowFmt);
            }

            if params != self.hdr_expected_params() {
                return Err(FtlErr::IncompatibleLowParams);
            }

            return Ok((blk, params));
        }

        Err(FtlErr::InvalidLowFmt)
    }
}
