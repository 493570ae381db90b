use serde::Serialize;

use crate::bitmap::Bitmap;
use crate::ceil_div;
use crate::error::FtlErr;
use crate::logger::Logger;
use crate::nand::{blk_is_factory_defect, Ctrlr};
use crate::util;

pub mod avail;
pub mod hdr;
pub mod meta;
pub mod oos;
pub mod secio;
pub mod ub;

use avail::AvailEntry;
use oos::SecType;
use ub::{SecLoc, UbExtra, UbTblEntry};

pub const BLK_IX_INVALID: u32 = 0xffff_ffff;
pub const SEC_OFFSET_INVALID: u32 = 0xffff_ffff;
pub const ERASE_CNT_INVALID: u32 = 0xffff_ffff;

/// Half and quarter of the meta sequence ID range, for the wrap-around
/// comparison and the stale-candidate window.
pub const META_ID_HALF: u32 = 0x8000_0000;
pub const META_ID_QUARTER: u32 = 0x4000_0000;


/// Open-time configuration. Validated once; the values that end up on the
/// device header must match on every subsequent mount.
#[derive(Clone, Debug)]
pub struct FtlCfg {
    /// Logical sector size; 0 means one sector per page.
    pub sec_size: u32,
    pub ub_cnt: u32,
    pub rub_max_assoc: u32,
    pub avail_blk_tbl_cnt: u32,
    /// Table entries reachable only by the metadata fold path.
    pub rsvd_avail_blk_cnt: u32,
    pub max_rd_retries: u32,
    /// Cap on concurrent SUBs, percent of the update-block count.
    pub max_sub_pct: u32,
    pub th_pct_merge_rub_start_sub: u32,
    pub th_pct_convert_sub_to_rub: u32,
    pub th_pct_pad_sub: u32,
    pub th_pct_merge_sub: u32,
    pub th_sub_min_idle_to_fold: u32,
    /// Commit metadata after every read and write.
    pub auto_sync_en: bool,
    /// Keep a packed (logical offset, associate) tag per update-block sector.
    pub ub_meta_cache_en: bool,
    /// Keep a RAM shadow of the last committed dirty bitmap.
    pub dirty_map_cache_en: bool,
    /// Power of two enabling range-restricted update-block search; 0 is off.
    pub ub_tbl_subset_size: u32,
    /// Erase all metadata blocks when mount finds a corrupted log.
    pub clr_corrupt_metablk: bool,
}

impl Default for FtlCfg {
    fn default() -> Self
    {
        Self {
            sec_size: 0,
            ub_cnt: 4,
            rub_max_assoc: 2,
            avail_blk_tbl_cnt: 4,
            rsvd_avail_blk_cnt: 1,
            max_rd_retries: 3,
            max_sub_pct: 30,
            th_pct_merge_rub_start_sub: 50,
            th_pct_convert_sub_to_rub: 25,
            th_pct_pad_sub: 5,
            th_pct_merge_sub: 10,
            th_sub_min_idle_to_fold: 5,
            auto_sync_en: false,
            ub_meta_cache_en: true,
            dirty_map_cache_en: true,
            ub_tbl_subset_size: 0,
            clr_corrupt_metablk: false,
        }
    }
}


/// Answer to the upward capacity query.
#[derive(Copy, Clone, Debug, Serialize)]
pub struct DevInfo {
    pub sec_size: u32,
    pub sec_cnt: u64,
    pub fixed: bool,
}


/// I/O control operations of the upward sector API.
#[derive(Clone, Debug)]
pub enum IoCtl {
    LowFmt,
    LowMount,
    LowUnmount,
    Sync,
    ChipErase,
    Refresh,
    Dump,
    RdSecPhy { sec_ix_phy: u64 },
    WrSecPhy { sec_ix_phy: u64, data: Vec<u8> },
    EraseBlkPhy { blk_ix_phy: u32 },
}

#[derive(Clone, Debug)]
pub enum IoCtlOut {
    None,
    Data(Vec<u8>),
    Text(String),
}


/// Classification of a physical block. At any quiescent point every block
/// is in exactly one class.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum BlkClass {
    Hdr,
    MetaActive,
    Data,
    Ub,
    Avail,
    Dirty,
    Bad,
    Unmapped,
}


#[derive(Serialize)]
struct DumpUb {
    blk_ix: u32,
    assoc: Vec<u32>,
    assoc_lvl: u32,
    next_sec_ix: u32,
    valid_cnt: usize,
}

#[derive(Serialize)]
struct DumpState {
    sec_size: u32,
    blk_cnt: u32,
    secs_per_blk: u32,
    data_blk_cnt: u32,
    mounted: bool,
    hdr_blk_ix: u32,
    meta_blk_ix: u32,
    meta_blk_id: u32,
    meta_next_sec_ix: u32,
    sub_cnt: u32,
    activity_ctr: u32,
    classes: Vec<String>,
    l2p: Vec<u32>,
    avail_tbl: Vec<AvailEntry>,
    bad_tbl: Vec<u32>,
    ub_tbl: Vec<DumpUb>,
}


/// One NAND translation-layer device instance. Single-threaded and
/// blocking; the caller serializes all operations.
pub struct NandDev<C: Ctrlr> {
    pub ctrlr: C,
    pub logger: Logger,
    cfg: FtlCfg,

    // Low-level parameters, fixed at open and pinned by the header.
    sec_size: u32,
    secs_per_pg: u32,
    spb: u32,
    blk_cnt: u32,
    n_data: u32,
    ub_cnt: u32,
    k_max: u32,
    avail_cnt: u32,
    rsvd_cnt: u32,
    max_bad: u32,
    oos_size: u32,
    ecc_strength: u32,
    max_rd_retries: u32,

    // Policy thresholds, converted from percentages to sector counts.
    th_merge_rub_start_sub: u32,
    th_convert_sub_to_rub: u32,
    th_pad_sub: u32,
    th_merge_sub: u32,
    sub_cap: u32,

    // Metadata image layout (byte offsets into the concatenated image).
    off_bad: usize,
    off_dirty: usize,
    off_ub: usize,
    meta_img_size: usize,
    meta_sec_cnt: u32,

    // Mounted state.
    mounted: bool,
    hdr_blk_ix: u32,
    l2p: Vec<u32>,
    bad_tbl: Vec<u32>,
    dirty_map: Bitmap,
    dirty_map_committed: Option<Bitmap>,
    dirty_srch_pos: u32,
    avail_tbl: Vec<AvailEntry>,
    avail_commit_map: Bitmap,
    avail_meta_map: Bitmap,
    avail_meta_id: Vec<u32>,
    ub_tbl: Vec<UbTblEntry>,
    ub_extra: Vec<UbExtra>,
    sub_cnt: u32,
    activity_ctr: u32,
    meta_blk_ix: u32,
    meta_blk_id: u32,
    meta_next_sec_ix: u32,
    meta_fold_needed: bool,
    meta_invalid_map: Bitmap,
    meta_erase_cnt_next: u32,
}

impl<C: Ctrlr> NandDev<C> {
    /// Binds a controller, validates the configuration against the
    /// partition geometry and prepares an unmounted device.
    pub fn open(mut ctrlr: C, cfg: FtlCfg, logger: Logger) -> Result<Self, FtlErr>
    {
        let part = ctrlr.part_data();

        let sec_size = if cfg.sec_size == 0 { part.page_size } else { cfg.sec_size };
        if sec_size == 0
            || !util::is_pow2(sec_size)
            || part.page_size % sec_size != 0
        {
            return Err(FtlErr::InvalidLowParams);
        }

        let oos_size = ctrlr.setup(sec_size)?;
        if oos::oos_partial_size(part.ecc_strength) > oos_size {
            return Err(FtlErr::InvalidLowParams);
        }

        let secs_per_pg = part.page_size / sec_size;
        let spb = part.pgs_per_blk * secs_per_pg;
        if !util::is_pow2(spb) {
            return Err(FtlErr::InvalidLowParams);
        }

        if cfg.ub_cnt == 0
            || cfg.rub_max_assoc == 0
            || cfg.avail_blk_tbl_cnt < cfg.rsvd_avail_blk_cnt + 1
            || cfg.max_rd_retries < 2
            || cfg.max_sub_pct > 100
            || cfg.th_pct_merge_rub_start_sub > 100
            || cfg.th_pct_convert_sub_to_rub > 100
            || cfg.th_pct_pad_sub > 100
            || cfg.th_pct_merge_sub > 100
            || cfg.avail_blk_tbl_cnt as usize * 8 > sec_size as usize
        {
            return Err(FtlErr::InvalidCfg);
        }
        if cfg.ub_tbl_subset_size != 0
            && (!util::is_pow2(cfg.ub_tbl_subset_size) || cfg.ub_tbl_subset_size > spb)
        {
            return Err(FtlErr::InvalidCfg);
        }

        let blk_cnt = part.blk_cnt;
        let max_bad = part.max_bad_blk_cnt;
        let overhead = 1 + cfg.ub_cnt + cfg.avail_blk_tbl_cnt + max_bad;
        if blk_cnt <= overhead {
            return Err(FtlErr::InvalidLowParams);
        }
        let n_data = blk_cnt - overhead;

        // Metadata image layout: available table first, exactly one sector.
        let off_bad = sec_size as usize;
        let off_dirty = off_bad + max_bad as usize * 4;
        let off_ub = off_dirty + ceil_div!(blk_cnt as usize, 8);
        let ub_entry_size = 4 + ceil_div!(spb as usize, 8);
        let meta_img_size = off_ub + cfg.ub_cnt as usize * ub_entry_size;
        let meta_sec_cnt = ceil_div!(meta_img_size, sec_size as usize) as u32;
        if meta_sec_cnt > spb {
            return Err(FtlErr::InvalidLowParams);
        }

        let pct = |p: u32| spb * p / 100;

        let dev = Self {
            ctrlr,
            logger,
            sec_size,
            secs_per_pg,
            spb,
            blk_cnt,
            n_data,
            ub_cnt: cfg.ub_cnt,
            k_max: cfg.rub_max_assoc,
            avail_cnt: cfg.avail_blk_tbl_cnt,
            rsvd_cnt: cfg.rsvd_avail_blk_cnt,
            max_bad,
            oos_size,
            ecc_strength: part.ecc_strength,
            max_rd_retries: cfg.max_rd_retries,
            th_merge_rub_start_sub: pct(cfg.th_pct_merge_rub_start_sub),
            th_convert_sub_to_rub: pct(cfg.th_pct_convert_sub_to_rub),
            th_pad_sub: pct(cfg.th_pct_pad_sub),
            th_merge_sub: pct(cfg.th_pct_merge_sub),
            sub_cap: (cfg.ub_cnt * cfg.max_sub_pct / 100).max(1),
            off_bad,
            off_dirty,
            off_ub,
            meta_img_size,
            meta_sec_cnt,
            mounted: false,
            hdr_blk_ix: BLK_IX_INVALID,
            l2p: vec![BLK_IX_INVALID; n_data as usize],
            bad_tbl: Vec::new(),
            dirty_map: Bitmap::new(blk_cnt as usize),
            dirty_map_committed: if cfg.dirty_map_cache_en {
                Some(Bitmap::new(blk_cnt as usize))
            } else {
                None
            },
            dirty_srch_pos: 0,
            avail_tbl: vec![AvailEntry::free(); cfg.avail_blk_tbl_cnt as usize],
            avail_commit_map: Bitmap::new(cfg.avail_blk_tbl_cnt as usize),
            avail_meta_map: Bitmap::new(cfg.avail_blk_tbl_cnt as usize),
            avail_meta_id: vec![ERASE_CNT_INVALID; cfg.avail_blk_tbl_cnt as usize],
            ub_tbl: (0..cfg.ub_cnt)
                .map(|_| UbTblEntry {
                    blk_ix: BLK_IX_INVALID,
                    valid_map: Bitmap::new(spb as usize),
                })
                .collect(),
            ub_extra: (0..cfg.ub_cnt)
                .map(|_| UbExtra::empty(cfg.rub_max_assoc as usize))
                .collect(),
            sub_cnt: 0,
            activity_ctr: 0,
            meta_blk_ix: BLK_IX_INVALID,
            meta_blk_id: 0,
            meta_next_sec_ix: 0,
            meta_fold_needed: false,
            meta_invalid_map: Bitmap::new(meta_sec_cnt as usize),
            meta_erase_cnt_next: 0,
            cfg,
        };

        Ok(dev)
    }

    fn state_reset(&mut self)
    {
        self.mounted = false;
        self.hdr_blk_ix = BLK_IX_INVALID;
        for entry in self.l2p.iter_mut() {
            *entry = BLK_IX_INVALID;
        }
        self.bad_tbl.clear();
        self.dirty_map.clear_all();
        if let Some(shadow) = self.dirty_map_committed.as_mut() {
            shadow.clear_all();
        }
        self.dirty_srch_pos = 0;
        for entry in self.avail_tbl.iter_mut() {
            *entry = AvailEntry::free();
        }
        self.avail_commit_map.clear_all();
        self.avail_meta_map.clear_all();
        for id in self.avail_meta_id.iter_mut() {
            *id = ERASE_CNT_INVALID;
        }
        for entry in self.ub_tbl.iter_mut() {
            entry.blk_ix = BLK_IX_INVALID;
            entry.valid_map.clear_all();
        }
        for extra in self.ub_extra.iter_mut() {
            *extra = UbExtra::empty(self.k_max as usize);
        }
        self.sub_cnt = 0;
        self.activity_ctr = 0;
        self.meta_blk_ix = BLK_IX_INVALID;
        self.meta_blk_id = 0;
        self.meta_next_sec_ix = 0;
        self.meta_fold_needed = false;
        self.meta_invalid_map.clear_all();
        self.meta_erase_cnt_next = 0;
    }

    /// Low-level format: header, factory-defect census, everything else
    /// dirty, a first metadata block with an empty committed image, then a
    /// validation mount.
    pub fn low_fmt(&mut self) -> Result<(), FtlErr>
    {
        self.logger.log(1, "low-level format");
        self.state_reset();

        // Stale metadata blocks would fight the fresh sequence at the next
        // boot scan; erase them first.
        let mut data = vec![0u8; self.sec_size as usize];
        let mut oos_buf = vec![0u8; self.oos_size as usize];
        for blk in 0..self.blk_cnt {
            let used = match self.sec_rd_phy_no_refresh(blk, 0, &mut data, &mut oos_buf) {
                Ok(u) => u,
                Err(FtlErr::EccUncorr) => false,
                Err(e) => return Err(e),
            };
            if used && oos::sec_type_of(&oos_buf) == Some(SecType::Metadata) {
                let _ = self.ctrlr.blk_erase(blk);
            }
        }

        self.hdr_wr()?;

        for blk in 0..self.blk_cnt {
            if blk == self.hdr_blk_ix {
                continue;
            }

            if blk_is_factory_defect(&mut self.ctrlr, blk, self.sec_size, self.secs_per_pg)? {
                if self.bad_tbl.len() >= self.max_bad as usize {
                    return Err(FtlErr::InvalidLowParams);
                }
                self.bad_tbl.push(blk);
                self.logger.log(2, &format!("factory defect at block {}", blk));
            } else {
                self.dirty_map.set(blk as usize);
            }
        }

        self.avail_tbl_fill(self.rsvd_cnt as usize + 1)?;

        let (meta_blk, erase_cnt) = self.get_erased_blk(false)?;
        self.meta_blk_ix = meta_blk;
        self.meta_blk_id = 0;
        self.meta_next_sec_ix = 0;
        self.meta_erase_cnt_next = erase_cnt;
        self.meta_fold_needed = false;
        self.meta_invalid_map.set_all();
        self.meta_commit(false)?;

        // Validate the work by mounting it.
        self.low_mount()
    }

    /// Low-level mount: header, metadata replay, block classification,
    /// update-block rebuild, available-table replay.
    pub fn low_mount(&mut self) -> Result<(), FtlErr>
    {
        self.state_reset();

        let (hdr_blk, _) = self.hdr_find()?;
        self.hdr_blk_ix = hdr_blk;

        self.meta_blk_find()?;
        self.meta_parse()?;

        let mut data = vec![0u8; self.sec_size as usize];
        let mut oos_buf = vec![0u8; self.oos_size as usize];

        for blk in 0..self.blk_cnt {
            if blk == self.hdr_blk_ix || blk == self.meta_blk_ix || self.blk_is_bad(blk) {
                continue;
            }

            let dirty = self.blk_is_dirty(blk);
            let is_avail = self.blk_is_avail(blk);

            if dirty && is_avail {
                // The committed available entry wins over the dirty bit.
                self.dirty_bit_clr(blk);
                continue;
            }
            if dirty || is_avail {
                continue;
            }

            if let Some(u) = self.ub_tbl.iter().position(|e| e.blk_ix == blk) {
                self.ub_load(u)?;
                continue;
            }

            // Unaccounted for: classify by the first sector.
            let used = match self.sec_rd_phy_no_refresh(blk, 0, &mut data, &mut oos_buf) {
                Ok(u) => u,
                Err(FtlErr::EccUncorr) => {
                    self.logger.log(1, &format!("mount: unreadable block {}", blk));
                    self.dirty_bit_set(blk);
                    continue;
                }
                Err(e) => return Err(e),
            };
            if !used {
                self.dirty_bit_set(blk);
                continue;
            }

            match oos::sec_type_of(&oos_buf) {
                Some(SecType::Storage) => {
                    let claimed = match oos::storage_oos_rd(&oos_buf) {
                        // A data block starts with its logical offset 0 or a
                        // dummy; anything else is a stray update-block
                        // fragment whose writes were never committed.
                        Ok(img)
                            if img.blk_ix_logical < self.n_data
                                && (img.sec_offset_logical == 0 || img.is_dummy()) =>
                        {
                            Some(img.blk_ix_logical)
                        }
                        _ => None,
                    };

                    match claimed {
                        Some(lb) if self.l2p[lb as usize] == BLK_IX_INVALID => {
                            self.l2p[lb as usize] = blk;
                        }
                        _ => self.dirty_bit_set(blk),
                    }
                }
                // A stale metadata block from a folded-out generation.
                Some(SecType::Metadata) => self.dirty_bit_set(blk),
                _ => self.dirty_bit_set(blk),
            }
        }

        self.meta_avail_replay()?;

        self.mounted = true;
        self.logger.log(1, &format!(
            "mounted: {} data blocks, meta block {} (id {})",
            self.n_data, self.meta_blk_ix, self.meta_blk_id,
        ));

        Ok(())
    }

    /// Commits pending metadata and forgets the mounted state.
    pub fn low_unmount(&mut self) -> Result<(), FtlErr>
    {
        if self.mounted {
            self.meta_commit(false)?;
        }
        self.state_reset();

        Ok(())
    }

    /// Explicit metadata commit request.
    pub fn sync(&mut self) -> Result<(), FtlErr>
    {
        if !self.mounted {
            return Err(FtlErr::InvalidLowFmt);
        }

        self.meta_commit(false)
    }

    pub fn query(&self) -> DevInfo
    {
        DevInfo {
            sec_size: self.sec_size,
            sec_cnt: self.n_data as u64 * self.spb as u64,
            fixed: true,
        }
    }

    /// Reads `cnt` logical sectors into `buf`. A sector that has never been
    /// written yields `NoSuchSec`; translating that to zero-fill is the
    /// caller's policy.
    pub fn rd(&mut self, sec_ix_logical: u64, cnt: u32, buf: &mut [u8]) -> Result<(), FtlErr>
    {
        if !self.mounted {
            return Err(FtlErr::InvalidLowFmt);
        }
        if sec_ix_logical + cnt as u64 > self.query().sec_cnt {
            return Err(FtlErr::NoSuchSec);
        }

        let ss = self.sec_size as usize;
        let mut oos_buf = vec![0u8; self.oos_size as usize];

        for i in 0..cnt as usize {
            let sec = sec_ix_logical + i as u64;
            let lb_ix = (sec / self.spb as u64) as u32;
            let off = (sec % self.spb as u64) as u32;
            let out = &mut buf[i * ss..(i + 1) * ss];

            match self.sec_find(lb_ix, off)? {
                SecLoc::Ub { ub_ix, sec_offset_phy } => {
                    let alias = self.lb_alias_ub(ub_ix);
                    self.sec_rd_handler(alias, sec_offset_phy, out, &mut oos_buf)?;
                }
                SecLoc::Data { .. } => {
                    self.sec_rd_handler(lb_ix, off, out, &mut oos_buf)?;
                }
                SecLoc::None => return Err(FtlErr::NoSuchSec),
            }
        }

        if self.cfg.auto_sync_en {
            self.meta_commit(false)?;
        }

        Ok(())
    }

    /// Writes `cnt` logical sectors from `buf` through the update-block
    /// machinery. `OpAborted` (a block died under the program) is retried
    /// here; each retry lands on a different physical block.
    pub fn wr(&mut self, sec_ix_logical: u64, cnt: u32, buf: &[u8]) -> Result<(), FtlErr>
    {
        if !self.mounted {
            return Err(FtlErr::InvalidLowFmt);
        }
        if sec_ix_logical + cnt as u64 > self.query().sec_cnt {
            return Err(FtlErr::NoSuchSec);
        }

        let ss = self.sec_size as usize;

        for i in 0..cnt as usize {
            let sec = sec_ix_logical + i as u64;
            let lb_ix = (sec / self.spb as u64) as u32;
            let off = (sec % self.spb as u64) as u32;
            let data = &buf[i * ss..(i + 1) * ss];
            let seq_cnt = cnt - i as u32;

            let mut written = false;
            for _ in 0..=self.max_bad {
                match self.sec_wr_logical(lb_ix, off, data, seq_cnt) {
                    Ok(()) => {
                        written = true;
                        break;
                    }
                    Err(FtlErr::OpAborted) => continue,
                    Err(e) => return Err(e),
                }
            }
            if !written {
                return Err(FtlErr::OpAborted);
            }
        }

        if self.cfg.auto_sync_en {
            self.meta_commit(false)?;
        }

        Ok(())
    }

    /// Debugging: erases every block, destroying the format.
    pub fn chip_erase(&mut self) -> Result<(), FtlErr>
    {
        for blk in 0..self.blk_cnt {
            let _ = self.ctrlr.blk_erase(blk);
        }
        self.state_reset();

        Ok(())
    }

    /// Refreshes every block holding live data or metadata.
    pub fn refresh_dev(&mut self) -> Result<(), FtlErr>
    {
        if !self.mounted {
            return Err(FtlErr::InvalidLowFmt);
        }

        let mut blks: Vec<u32> = self.l2p.iter().copied()
            .filter(|b| *b != BLK_IX_INVALID)
            .collect();
        blks.extend(self.ub_tbl.iter().map(|e| e.blk_ix).filter(|b| *b != BLK_IX_INVALID));
        blks.push(self.meta_blk_ix);

        for blk in blks {
            self.blk_refresh(blk)?;
        }

        Ok(())
    }

    fn blk_claims(&self, blk_ix: u32) -> Vec<BlkClass>
    {
        let mut claims = Vec::new();

        if self.blk_is_bad(blk_ix) {
            claims.push(BlkClass::Bad);
        }
        if blk_ix == self.hdr_blk_ix {
            claims.push(BlkClass::Hdr);
        }
        if blk_ix == self.meta_blk_ix {
            claims.push(BlkClass::MetaActive);
        }
        if self.blk_is_ub(blk_ix) {
            claims.push(BlkClass::Ub);
        }
        if self.blk_is_avail(blk_ix) {
            claims.push(BlkClass::Avail);
        }
        if self.blk_is_dirty(blk_ix) {
            claims.push(BlkClass::Dirty);
        }
        if self.l2p.contains(&blk_ix) {
            claims.push(BlkClass::Data);
        }

        claims
    }

    pub fn blk_class(&self, blk_ix: u32) -> BlkClass
    {
        self.blk_claims(blk_ix).first().copied().unwrap_or(BlkClass::Unmapped)
    }

    /// Checks that the block classes partition the array: every block in
    /// exactly one class.
    pub fn blk_census_ok(&self) -> bool
    {
        (0..self.blk_cnt).all(|blk| self.blk_claims(blk).len() == 1)
    }

    /// JSON state dump for debugging.
    pub fn dump(&self) -> Result<String, FtlErr>
    {
        let state = DumpState {
            sec_size: self.sec_size,
            blk_cnt: self.blk_cnt,
            secs_per_blk: self.spb,
            data_blk_cnt: self.n_data,
            mounted: self.mounted,
            hdr_blk_ix: self.hdr_blk_ix,
            meta_blk_ix: self.meta_blk_ix,
            meta_blk_id: self.meta_blk_id,
            meta_next_sec_ix: self.meta_next_sec_ix,
            sub_cnt: self.sub_cnt,
            activity_ctr: self.activity_ctr,
            classes: (0..self.blk_cnt)
                .map(|blk| format!("{:?}", self.blk_class(blk)))
                .collect(),
            l2p: self.l2p.clone(),
            avail_tbl: self.avail_tbl.clone(),
            bad_tbl: self.bad_tbl.clone(),
            ub_tbl: self.ub_tbl.iter().zip(self.ub_extra.iter())
                .map(|(entry, extra)| DumpUb {
                    blk_ix: entry.blk_ix,
                    assoc: extra.assoc.clone(),
                    assoc_lvl: extra.assoc_lvl,
                    next_sec_ix: extra.next_sec_ix,
                    valid_cnt: entry.valid_map.count_set(),
                })
                .collect(),
        };

        serde_json::to_string_pretty(&state).map_err(|_| FtlErr::InvalidMetadata)
    }

    /// The upward I/O control dispatcher.
    pub fn io_ctl(&mut self, op: IoCtl) -> Result<IoCtlOut, FtlErr>
    {
        match op {
            IoCtl::LowFmt => self.low_fmt().map(|_| IoCtlOut::None),
            IoCtl::LowMount => self.low_mount().map(|_| IoCtlOut::None),
            IoCtl::LowUnmount => self.low_unmount().map(|_| IoCtlOut::None),
            IoCtl::Sync => self.sync().map(|_| IoCtlOut::None),
            IoCtl::ChipErase => self.chip_erase().map(|_| IoCtlOut::None),
            IoCtl::Refresh => self.refresh_dev().map(|_| IoCtlOut::None),
            IoCtl::Dump => self.dump().map(IoCtlOut::Text),
            IoCtl::RdSecPhy { sec_ix_phy } => {
                let mut data = vec![0u8; self.sec_size as usize];
                let mut oos_buf = vec![0u8; self.oos_size as usize];
                let _ = self.ctrlr.sec_rd(&mut data, &mut oos_buf, sec_ix_phy)?;
                data.extend_from_slice(&oos_buf);
                Ok(IoCtlOut::Data(data))
            }
            IoCtl::WrSecPhy { sec_ix_phy, data } => {
                let oos_buf = vec![0xffu8; self.oos_size as usize];
                self.ctrlr.sec_wr(&data, &oos_buf, sec_ix_phy)?;
                Ok(IoCtlOut::None)
            }
            IoCtl::EraseBlkPhy { blk_ix_phy } => {
                if blk_ix_phy >= self.blk_cnt {
                    return Err(FtlErr::InvalidIoCtl);
                }
                self.ctrlr.blk_erase(blk_ix_phy)?;
                Ok(IoCtlOut::None)
            }
        }
    }
}


// Tests: end-to-end scenarios against the RAM controller.


#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::Logger;
    use crate::nand::ram::RamCtrlr;
    use crate::nand::{DefectMark, EccStatus, PartData};

    fn part(blk_cnt: u32, pgs_per_blk: u32, page_size: u32, spare_size: u32, max_bad: u32)
        -> PartData
    {
        PartData {
            page_size,
            pgs_per_blk,
            blk_cnt,
            programs_per_pg: 1,
            spare_size,
            bus_width: 8,
            max_bad_blk_cnt: max_bad,
            defect_mark: DefectMark::SpareL1Pg1Or2,
            ecc_strength: 2,
        }
    }

    fn small_part() -> PartData
    {
        part(64, 8, 512, 32, 4)
    }

    fn small_cfg() -> FtlCfg
    {
        FtlCfg {
            ub_cnt: 2,
            avail_blk_tbl_cnt: 4,
            ..FtlCfg::default()
        }
    }

    fn fmt_dev(p: PartData, cfg: FtlCfg) -> NandDev<RamCtrlr>
    {
        let mut dev = NandDev::open(RamCtrlr::new(p), cfg, Logger::quiet()).unwrap();
        dev.low_fmt().unwrap();
        dev
    }

    /// Models power loss: clones the media and mounts the clone.
    fn remount(dev: &NandDev<RamCtrlr>) -> NandDev<RamCtrlr>
    {
        let snap = dev.ctrlr.snapshot();
        let mut nd = NandDev::open(snap, dev.cfg.clone(), Logger::quiet()).unwrap();
        nd.low_mount().unwrap();
        nd
    }

    fn wr1(dev: &mut NandDev<RamCtrlr>, sec: u64, byte: u8)
    {
        let data = vec![byte; dev.sec_size as usize];
        dev.wr(sec, 1, &data).unwrap();
    }

    fn rd1(dev: &mut NandDev<RamCtrlr>, sec: u64) -> Result<Vec<u8>, FtlErr>
    {
        let mut buf = vec![0u8; dev.sec_size as usize];
        dev.rd(sec, 1, &mut buf)?;
        Ok(buf)
    }

    fn assert_census(dev: &NandDev<RamCtrlr>)
    {
        for blk in 0..dev.blk_cnt {
            let claims = dev.blk_claims(blk);
            assert_eq!(claims.len(), 1, "block {} claims {:?}", blk, claims);
        }
    }

    #[test]
    fn s1_format_write_read()
    {
        // 256 blocks x 64 pages x 2048 B, one sector per page.
        let mut dev = fmt_dev(part(256, 64, 2048, 64, 40), FtlCfg::default());

        let val = vec![0xa5u8; 2048];
        dev.wr(100, 1, &val).unwrap();

        let mut out = vec![0u8; 2048];
        dev.rd(100, 1, &mut out).unwrap();
        assert_eq!(out, val);

        assert_eq!(dev.rd(101, 1, &mut out), Err(FtlErr::NoSuchSec));
        assert_census(&dev);

        dev.sync().unwrap();
        let mut re = remount(&dev);
        let mut out = vec![0u8; 2048];
        re.rd(100, 1, &mut out).unwrap();
        assert_eq!(out, val);
        assert_eq!(re.rd(101, 1, &mut out), Err(FtlErr::NoSuchSec));
        assert_census(&re);
    }

    #[test]
    fn s2_power_loss_before_sync()
    {
        let mut dev = fmt_dev(small_part(), small_cfg());

        wr1(&mut dev, 50, 0x11);
        dev.sync().unwrap();
        wr1(&mut dev, 50, 0x22); // not synced

        let mut re = remount(&dev); // power loss
        assert_eq!(rd1(&mut re, 50).unwrap(), vec![0x11; 512]);

        wr1(&mut re, 50, 0x33);
        re.sync().unwrap();
        let mut re2 = remount(&re);
        assert_eq!(rd1(&mut re2, 50).unwrap(), vec![0x33; 512]);
        assert_census(&re2);
    }

    #[test]
    fn s3_rub_full_merge()
    {
        let cfg = FtlCfg {
            ub_cnt: 1,
            rub_max_assoc: 2,
            avail_blk_tbl_cnt: 4,
            ..FtlCfg::default()
        };
        let mut dev = fmt_dev(part(64, 128, 512, 32, 4), cfg);
        let spb = 128u64;

        wr1(&mut dev, 10 * spb, 0x10);
        wr1(&mut dev, 10 * spb + 127, 0x7f);
        for off in 0..128u64 {
            wr1(&mut dev, 11 * spb + off, off as u8);
        }

        // Both associates were merged out; the slot restarted for block 11.
        assert!(dev.ub_find(10).is_none());

        assert_eq!(rd1(&mut dev, 10 * spb).unwrap(), vec![0x10; 512]);
        assert_eq!(rd1(&mut dev, 10 * spb + 127).unwrap(), vec![0x7f; 512]);
        for off in 0..128u64 {
            assert_eq!(rd1(&mut dev, 11 * spb + off).unwrap(), vec![off as u8; 512]);
        }

        dev.sync().unwrap();
        assert_census(&dev);

        let mut re = remount(&dev);
        for off in 0..128u64 {
            assert_eq!(rd1(&mut re, 11 * spb + off).unwrap(), vec![off as u8; 512]);
        }
        assert_census(&re);
    }

    #[test]
    fn s4_sub_to_rub_promotion()
    {
        let cfg = FtlCfg {
            ub_cnt: 2,
            rub_max_assoc: 2,
            avail_blk_tbl_cnt: 4,
            max_sub_pct: 50,
            th_pct_merge_rub_start_sub: 50,
            th_pct_convert_sub_to_rub: 50,
            ..FtlCfg::default()
        };
        let mut dev = fmt_dev(part(64, 128, 512, 32, 4), cfg);
        let spb = 128u64;

        // A 64-sector sequential run from offset 0 opens a SUB.
        let mut buf = Vec::new();
        for off in 0..64u64 {
            buf.extend_from_slice(&vec![off as u8; 512]);
        }
        dev.wr(7 * spb, 64, &buf).unwrap();

        let u = dev.ub_find(7).unwrap();
        assert!(dev.ub_is_sub(u));

        // Overwriting a written offset violates sequentiality; with half the
        // block still free the SUB is promoted instead of merged.
        wr1(&mut dev, 7 * spb + 63, 0xee);

        let u = dev.ub_find(7).unwrap();
        assert!(!dev.ub_is_sub(u));
        assert_eq!(dev.ub_extra[u].next_sec_ix, 65);

        assert_eq!(rd1(&mut dev, 7 * spb + 63).unwrap(), vec![0xee; 512]);
        assert_eq!(rd1(&mut dev, 7 * spb + 62).unwrap(), vec![62; 512]);

        dev.sync().unwrap();
        let mut re = remount(&dev);
        assert_eq!(rd1(&mut re, 7 * spb + 63).unwrap(), vec![0xee; 512]);
        assert_eq!(rd1(&mut re, 7 * spb).unwrap(), vec![0; 512]);
        assert_census(&re);
    }

    #[test]
    fn sequential_run_evicts_rub_not_spacious_sub()
    {
        // Both slots occupied: a nearly-empty SUB and a RUB. A new
        // sequential run must evict the RUB and leave the spacious SUB
        // alone.
        let cfg = FtlCfg {
            ub_cnt: 2,
            rub_max_assoc: 1,
            avail_blk_tbl_cnt: 4,
            max_sub_pct: 100,
            ..FtlCfg::default()
        };
        let mut dev = fmt_dev(small_part(), cfg);

        // Spacious SUB for block 10: half the block still free.
        let mut buf = Vec::new();
        for off in 0..4u64 {
            buf.extend_from_slice(&vec![off as u8; 512]);
        }
        dev.wr(10 * 8, 4, &buf).unwrap();

        let u_sub = dev.ub_find(10).unwrap();
        assert!(dev.ub_is_sub(u_sub));
        assert_eq!(dev.ub_extra[u_sub].next_sec_ix, 4);

        // RUB for block 11.
        wr1(&mut dev, 11 * 8 + 5, 0xb5);
        let u_rub = dev.ub_find(11).unwrap();
        assert!(!dev.ub_is_sub(u_rub));

        // New sequential run for block 12.
        let mut buf = Vec::new();
        for off in 0..4u64 {
            buf.extend_from_slice(&vec![0xc0 + off as u8; 512]);
        }
        dev.wr(12 * 8, 4, &buf).unwrap();

        // The RUB was merged out; the spacious SUB is untouched.
        assert!(dev.ub_find(11).is_none());
        let u_sub = dev.ub_find(10).unwrap();
        assert!(dev.ub_is_sub(u_sub));
        assert_eq!(dev.ub_extra[u_sub].next_sec_ix, 4);
        let u_new = dev.ub_find(12).unwrap();
        assert!(dev.ub_is_sub(u_new));

        assert_eq!(rd1(&mut dev, 11 * 8 + 5).unwrap(), vec![0xb5; 512]);
        for off in 0..4u64 {
            assert_eq!(rd1(&mut dev, 10 * 8 + off).unwrap(), vec![off as u8; 512]);
            assert_eq!(rd1(&mut dev, 12 * 8 + off).unwrap(), vec![0xc0 + off as u8; 512]);
        }

        dev.sync().unwrap();
        assert_census(&dev);
    }

    #[test]
    fn s5_bad_block_on_program()
    {
        let mut dev = fmt_dev(small_part(), small_cfg());

        dev.ctrlr.fail_next_pgm_of_type(SecType::Storage.as_raw());

        wr1(&mut dev, 20 * 8, 0x5a);

        // The block died, was marked bad and the retry landed elsewhere.
        assert_eq!(dev.bad_tbl.len(), 1);
        assert_eq!(rd1(&mut dev, 20 * 8).unwrap(), vec![0x5a; 512]);

        dev.sync().unwrap();
        let mut re = remount(&dev);
        assert_eq!(re.bad_tbl.len(), 1);
        assert_eq!(rd1(&mut re, 20 * 8).unwrap(), vec![0x5a; 512]);
        assert_census(&re);
    }

    #[test]
    fn s6_metadata_fold()
    {
        let mut dev = fmt_dev(small_part(), small_cfg());

        wr1(&mut dev, 0, 0x77);
        dev.sync().unwrap();

        let old_meta = dev.meta_blk_ix;
        let old_id = dev.meta_blk_id;

        // Drive the append point to one short of the block end.
        while dev.meta_next_sec_ix < dev.spb - 1 {
            let off_dirty = dev.off_dirty;
            dev.meta_invalidate(off_dirty, 1);
            dev.meta_commit(false).unwrap();
        }

        // A full-image commit no longer fits: fold.
        let img_size = dev.meta_img_size;
        dev.meta_invalidate(0, img_size);
        dev.sync().unwrap();

        assert_ne!(dev.meta_blk_ix, old_meta);
        assert_eq!(dev.meta_blk_id, old_id.wrapping_add(1));
        assert!(dev.avail_used_cnt() >= dev.rsvd_cnt as usize);

        let mut re = remount(&dev);
        assert_eq!(re.meta_blk_ix, dev.meta_blk_ix);
        assert_eq!(rd1(&mut re, 0).unwrap(), vec![0x77; 512]);

        // The folded-out block's erase count survives: it reenters the pool
        // at the count it was stamped with.
        re.avail_tbl_fill(re.avail_cnt as usize).ok();
        let entry = re.avail_tbl.iter()
            .find(|e| e.blk_ix == old_meta)
            .expect("folded-out block reenters the available pool");
        assert_eq!(entry.erase_cnt, 1);
        assert_census(&re);
    }

    #[test]
    fn header_roundtrip()
    {
        let dev = fmt_dev(small_part(), small_cfg());
        let mut re = remount(&dev);

        let (blk, params) = re.hdr_find().unwrap();
        assert_eq!(blk, re.hdr_blk_ix);
        assert_eq!(params, re.hdr_expected_params());
    }

    #[test]
    fn mount_unformatted_fails()
    {
        let mut dev =
            NandDev::open(RamCtrlr::new(small_part()), small_cfg(), Logger::quiet()).unwrap();

        assert_eq!(dev.low_mount(), Err(FtlErr::InvalidLowFmt));
    }

    #[test]
    fn incompatible_params_detected()
    {
        let dev = fmt_dev(small_part(), small_cfg());

        let cfg = FtlCfg { ub_cnt: 3, ..small_cfg() };
        let mut nd = NandDev::open(dev.ctrlr.snapshot(), cfg, Logger::quiet()).unwrap();
        assert_eq!(nd.low_mount(), Err(FtlErr::IncompatibleLowParams));
    }

    #[test]
    fn unmount_then_remount_in_place()
    {
        let mut dev = fmt_dev(small_part(), small_cfg());

        wr1(&mut dev, 3, 0x99);
        dev.low_unmount().unwrap();

        let mut buf = vec![0u8; 512];
        assert_eq!(dev.rd(3, 1, &mut buf), Err(FtlErr::InvalidLowFmt));

        dev.low_mount().unwrap();
        assert_eq!(rd1(&mut dev, 3).unwrap(), vec![0x99; 512]);
    }

    #[test]
    fn format_marks_factory_defects()
    {
        let mut ctrlr = RamCtrlr::new(small_part());
        ctrlr.plant_factory_defect(0);
        ctrlr.plant_factory_defect(5);

        let mut dev = NandDev::open(ctrlr, small_cfg(), Logger::quiet()).unwrap();
        dev.low_fmt().unwrap();

        assert_eq!(dev.hdr_blk_ix, 1);
        assert!(dev.blk_is_bad(0));
        assert!(dev.blk_is_bad(5));
        assert_census(&dev);
    }

    #[test]
    fn refresh_on_ecc_stress()
    {
        let mut dev = fmt_dev(small_part(), small_cfg());

        wr1(&mut dev, 8, 0x42);
        let u = dev.ub_find(1).unwrap();
        let blk = dev.ub_tbl[u].blk_ix;

        let phys = dev.sec_phys_ix(blk, 0);
        dev.ctrlr.force_ecc(phys, EccStatus::CriticalCorr);

        // The read succeeds and the stressed block is moved wholesale.
        assert_eq!(rd1(&mut dev, 8).unwrap(), vec![0x42; 512]);
        assert_ne!(dev.ub_tbl[u].blk_ix, blk);
        assert!(dev.blk_is_dirty(blk));
        assert_eq!(rd1(&mut dev, 8).unwrap(), vec![0x42; 512]);
        assert_census(&dev);
    }

    #[test]
    fn multi_sector_write_spans_blocks()
    {
        let mut dev = fmt_dev(small_part(), small_cfg());

        let mut buf = Vec::new();
        for i in 0..20u64 {
            buf.extend_from_slice(&vec![(4 + i) as u8; 512]);
        }
        dev.wr(4, 20, &buf).unwrap();

        let mut out = vec![0u8; 20 * 512];
        dev.rd(4, 20, &mut out).unwrap();
        assert_eq!(out, buf);

        dev.sync().unwrap();
        assert_census(&dev);

        let mut re = remount(&dev);
        let mut out = vec![0u8; 20 * 512];
        re.rd(4, 20, &mut out).unwrap();
        assert_eq!(out, buf);
        assert_census(&re);
    }

    #[test]
    fn alternate_cache_cfg()
    {
        // No meta cache (OOS re-reads), no dirty shadow, subset search on.
        let cfg = FtlCfg {
            ub_cnt: 2,
            avail_blk_tbl_cnt: 4,
            ub_meta_cache_en: false,
            dirty_map_cache_en: false,
            ub_tbl_subset_size: 2,
            ..FtlCfg::default()
        };
        let mut dev = fmt_dev(small_part(), cfg);

        for i in 0..16u64 {
            wr1(&mut dev, i, i as u8);
        }
        for i in 0..8u64 {
            wr1(&mut dev, i, 0x80 + i as u8);
        }

        for i in 0..8u64 {
            assert_eq!(rd1(&mut dev, i).unwrap(), vec![0x80 + i as u8; 512]);
        }
        for i in 8..16u64 {
            assert_eq!(rd1(&mut dev, i).unwrap(), vec![i as u8; 512]);
        }

        dev.sync().unwrap();
        let mut re = remount(&dev);
        for i in 0..8u64 {
            assert_eq!(rd1(&mut re, i).unwrap(), vec![0x80 + i as u8; 512]);
        }
        assert_census(&re);
    }

    #[test]
    fn auto_sync_commits_every_write()
    {
        let cfg = FtlCfg {
            ub_cnt: 2,
            avail_blk_tbl_cnt: 4,
            auto_sync_en: true,
            ..FtlCfg::default()
        };
        let mut dev = fmt_dev(small_part(), cfg);

        wr1(&mut dev, 5, 0xab);

        // No explicit sync; the write must already be durable.
        let mut re = remount(&dev);
        assert_eq!(rd1(&mut re, 5).unwrap(), vec![0xab; 512]);
    }

    #[test]
    fn query_reports_data_capacity()
    {
        let dev = fmt_dev(small_part(), small_cfg());
        let info = dev.query();

        // 64 blocks minus header, update blocks, available table, bad cap.
        assert_eq!(info.sec_cnt, (64 - 1 - 2 - 4 - 4) as u64 * 8);
        assert_eq!(info.sec_size, 512);
        assert!(info.fixed);
    }

    #[test]
    fn dump_renders()
    {
        let dev = fmt_dev(small_part(), small_cfg());
        let text = dev.dump().unwrap();

        assert!(text.contains("\"mounted\": true"));
        assert!(text.contains("\"classes\""));
    }
}
