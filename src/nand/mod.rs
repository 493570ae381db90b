use std::fmt::Debug;

pub mod file;
pub mod ram;

use crate::error::FtlErr;


/// Transport-level controller failures. ECC outcomes are not errors; they
/// are reported through `EccStatus` so callers can react per sector.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CtrlrErr {
    Io,
    Timeout,
}

impl From<CtrlrErr> for FtlErr {
    fn from(err: CtrlrErr) -> Self
    {
        match err {
            CtrlrErr::Io => FtlErr::DevIo,
            CtrlrErr::Timeout => FtlErr::DevTimeout,
        }
    }
}


/// ECC outcome of a sector read.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EccStatus {
    /// No bit errors.
    Ok,
    /// Bit errors corrected, comfortably within ECC strength.
    Corr,
    /// Corrected, but the error count reached the correction limit.
    CriticalCorr,
    /// Uncorrectable. The data buffer holds whatever was read.
    Uncorr,
}


/// Factory bad-block marking conventions. Each one dictates which locations
/// of which pages must be checked for the defect marker. A "location" is one
/// byte on an 8-bit bus and two bytes on a 16-bit bus.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DefectMark {
    /// Any spare byte of the first or last page is 0x00.
    SpareAnyPg1OrNAll0,
    /// Spare locations 1 and 6 of the first page are not all-0xFF.
    SpareB16W1InPg1,
    /// Spare location 6 of the first or second page is not all-0xFF.
    SpareB6W1Pg1Or2,
    /// Spare location 1 of the first or second page is not all-0xFF.
    SpareL1Pg1Or2,
    /// Spare location 1 of the first or last page is 0x00.
    SpareL1Pg1OrNAll0,
    /// In-page location 1 of the first or second page is not all-0xFF.
    PgL1OrNPg1Or2,
}


/// Partition geometry, as reported by the controller.
#[derive(Copy, Clone, Debug)]
pub struct PartData {
    pub page_size: u32,
    pub pgs_per_blk: u32,
    pub blk_cnt: u32,
    pub programs_per_pg: u32,
    pub spare_size: u32,
    pub bus_width: u32,
    pub max_bad_blk_cnt: u32,
    pub defect_mark: DefectMark,
    pub ecc_strength: u32,
}


/// The downward NAND controller API.
///
/// All addresses are physical: `sec_ix_phy` counts sectors from the start of
/// the partition, `pg_ix_phy` counts pages. Every operation is synchronous
/// and fallible; the translation layer serializes all calls.
pub trait Ctrlr: Debug {
    /// Fixes the sector size and returns the usable out-of-sector size per
    /// sector (spare area minus what the controller reserves for ECC).
    fn setup(&mut self, sec_size: u32) -> Result<u32, CtrlrErr>;

    fn part_data(&self) -> PartData;

    /// Reads one sector and its usable OOS area, reporting the ECC outcome.
    /// The buffers are filled even on `Uncorr`.
    fn sec_rd(&mut self, data: &mut [u8], oos: &mut [u8], sec_ix_phy: u64)
        -> Result<EccStatus, CtrlrErr>;

    /// Programs one sector together with its usable OOS area.
    fn sec_wr(&mut self, data: &[u8], oos: &[u8], sec_ix_phy: u64)
        -> Result<(), CtrlrErr>;

    fn blk_erase(&mut self, blk_ix_phy: u32) -> Result<(), CtrlrErr>;

    /// Reads part of a sector's usable OOS area without ECC. Used to probe
    /// the used mark of sectors whose payload may be unreadable.
    fn oos_rd_raw(&mut self, buf: &mut [u8], sec_ix_phy: u64, offset: u32)
        -> Result<(), CtrlrErr>;

    /// Reads part of a page's raw spare area (including the regions the
    /// controller reserves). Used for factory-defect detection only.
    fn spare_rd_raw(&mut self, buf: &mut [u8], pg_ix_phy: u64, offset: u32)
        -> Result<(), CtrlrErr>;
}


/// Checks a block for a factory defect marker, per the partition's marking
/// convention. `sec_size` and `secs_per_pg` must match a completed `setup`.
pub fn blk_is_factory_defect<C: Ctrlr>(
    ctrlr: &mut C,
    blk_ix: u32,
    sec_size: u32,
    secs_per_pg: u32,
) -> Result<bool, CtrlrErr>
{
    let part = ctrlr.part_data();
    let width = (part.bus_width / 8).max(1) as usize;
    let pg_first = blk_ix as u64 * part.pgs_per_blk as u64;
    let pg_last = pg_first + part.pgs_per_blk as u64 - 1;
    let pg_second = pg_first + 1;

    // Reads one location (bus-width bytes) of a page's spare.
    let spare_loc = |ctrlr: &mut C, pg: u64, loc: usize| -> Result<Vec<u8>, CtrlrErr> {
        let mut buf = vec![0u8; width];
        ctrlr.spare_rd_raw(&mut buf, pg, (loc * width) as u32)?;
        Ok(buf)
    };

    let defect = match part.defect_mark {
        DefectMark::SpareAnyPg1OrNAll0 => {
            let mut found = false;
            for pg in [pg_first, pg_last] {
                let mut buf = vec![0u8; part.spare_size as usize];
                ctrlr.spare_rd_raw(&mut buf, pg, 0)?;
                if buf.iter().any(|b| *b == 0x00) {
                    found = true;
                }
            }
            found
        }
        DefectMark::SpareB16W1InPg1 => {
            let a = spare_loc(ctrlr, pg_first, 0)?;
            let b = spare_loc(ctrlr, pg_first, 5)?;
            a.iter().chain(b.iter()).any(|b| *b != 0xff)
        }
        DefectMark::SpareB6W1Pg1Or2 => {
            let a = spare_loc(ctrlr, pg_first, 5)?;
            let b = spare_loc(ctrlr, pg_second, 5)?;
            a.iter().chain(b.iter()).any(|b| *b != 0xff)
        }
        DefectMark::SpareL1Pg1Or2 => {
            let a = spare_loc(ctrlr, pg_first, 0)?;
            let b = spare_loc(ctrlr, pg_second, 0)?;
            a.iter().chain(b.iter()).any(|b| *b != 0xff)
        }
        DefectMark::SpareL1Pg1OrNAll0 => {
            let a = spare_loc(ctrlr, pg_first, 0)?;
            let b = spare_loc(ctrlr, pg_last, 0)?;
            a.iter().all(|b| *b == 0x00) || b.iter().all(|b| *b == 0x00)
        }
        DefectMark::PgL1OrNPg1Or2 => {
            // The marker lives in the page itself; read through the sector
            // path and inspect the first location, ignoring the ECC outcome.
            let mut found = false;
            for pg in [pg_first, pg_second] {
                let mut data = vec![0u8; sec_size as usize];
                let mut oos = vec![0u8; 1];
                let sec = pg * secs_per_pg as u64;
                let _ = ctrlr.sec_rd(&mut data, &mut oos, sec)?;
                if data[..width].iter().any(|b| *b != 0xff) {
                    found = true;
                }
            }
            found
        }
    };

    Ok(defect)
}
