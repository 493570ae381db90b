use serde::{Deserialize, Serialize};

use crate::error::FtlErr;
use crate::nand::{Ctrlr, CtrlrErr};
use super::{NandDev, BLK_IX_INVALID, ERASE_CNT_INVALID, META_ID_QUARTER};
use super::oos::{self, SecType};

/// One slot of the available-block table. A free slot holds all-invalid.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AvailEntry {
    pub blk_ix: u32,
    pub erase_cnt: u32,
}

impl AvailEntry {
    pub fn free() -> Self
    {
        Self {
            blk_ix: BLK_IX_INVALID,
            erase_cnt: ERASE_CNT_INVALID,
        }
    }

    pub fn is_free(&self) -> bool
    {
        self.blk_ix == BLK_IX_INVALID
    }
}

impl<C: Ctrlr> NandDev<C> {
    pub fn blk_is_avail(&self, blk_ix: u32) -> bool
    {
        self.avail_tbl.iter().any(|e| e.blk_ix == blk_ix)
    }

    pub fn avail_used_cnt(&self) -> usize
    {
        self.avail_tbl.iter().filter(|e| !e.is_free()).count()
    }

    pub fn avail_entry_rd(&self, ix: usize) -> AvailEntry
    {
        self.avail_tbl[ix]
    }

    /// Overwrites a table slot and invalidates the table for the next
    /// commit. The commit and meta-candidate marks are cleared; callers that
    /// know better set them afterwards.
    pub fn avail_entry_wr(&mut self, ix: usize, entry: AvailEntry)
    {
        self.avail_tbl[ix] = entry;
        self.avail_commit_map.clear(ix);
        self.avail_meta_map.clear(ix);
        self.avail_meta_id[ix] = ERASE_CNT_INVALID;
        self.meta_invalidate(0, 1);
    }

    /// Inserts a block into the lowest free slot. The block's first sector
    /// is probed to recover its erase count (and, if it recently held
    /// metadata, to flag the entry as a meta candidate); `erase_cnt_known`
    /// overrides the probed count.
    pub fn avail_blk_add(&mut self, blk_ix: u32, erase_cnt_known: Option<u32>)
        -> Result<(), FtlErr>
    {
        let slot = match self.avail_tbl.iter().position(|e| e.is_free()) {
            Some(s) => s,
            None => return Err(FtlErr::DevFull),
        };

        let mut data = vec![0u8; self.sec_size as usize];
        let mut oos_buf = vec![0u8; self.oos_size as usize];
        let mut erase_cnt = erase_cnt_known.unwrap_or(0);
        let mut meta_id = None;

        match self.sec_rd_phy_no_refresh(blk_ix, 0, &mut data, &mut oos_buf) {
            Ok(true) => {
                if erase_cnt_known.is_none() {
                    let probed = oos::erase_cnt_of(&oos_buf);
                    if probed != ERASE_CNT_INVALID {
                        erase_cnt = probed;
                    }
                }
                if oos::sec_type_of(&oos_buf) == Some(SecType::Metadata) {
                    if let Ok(img) = oos::meta_oos_rd(&oos_buf) {
                        meta_id = Some(img.meta_blk_id);
                    }
                }
            }
            Ok(false) => (),
            // The erase count of an unreadable block is lost; it restarts
            // at the supplied count or zero.
            Err(FtlErr::EccUncorr) => (),
            Err(e) => return Err(e),
        }

        self.avail_entry_wr(slot, AvailEntry { blk_ix, erase_cnt });

        if let Some(id) = meta_id {
            self.avail_meta_map.set(slot);
            self.avail_meta_id[slot] = id;
        }

        Ok(())
    }

    /// Removes a block from the table. Returns its stored erase count plus
    /// one, which is the count to stamp on the block's next first write.
    pub fn avail_blk_remove(&mut self, blk_ix: u32) -> Option<u32>
    {
        let slot = self.avail_tbl.iter().position(|e| e.blk_ix == blk_ix)?;
        let erase_cnt = self.avail_tbl[slot].erase_cnt;

        self.avail_entry_wr(slot, AvailEntry::free());

        Some(erase_cnt.wrapping_add(1))
    }

    /// Fills the table up to `min_cnt` entries by draining the dirty bitmap,
    /// round-robin from the saved search position.
    pub fn avail_tbl_fill(&mut self, min_cnt: usize) -> Result<(), FtlErr>
    {
        let min_cnt = min_cnt.min(self.avail_cnt as usize);

        while self.avail_used_cnt() < min_cnt {
            let blk = match self.dirty_map.next_set(self.dirty_srch_pos as usize) {
                Some(b) => b as u32,
                None => return Err(FtlErr::NoAvailBlk),
            };

            self.dirty_srch_pos = (blk + 1) % self.blk_cnt;
            self.dirty_bit_clr(blk);

            // A dirty mark on the header or the active metadata block is
            // stale bookkeeping; drop the bit and keep searching.
            if blk == self.hdr_blk_ix || blk == self.meta_blk_ix || self.blk_is_bad(blk) {
                continue;
            }

            self.avail_blk_add(blk, None)?;
        }

        Ok(())
    }

    /// The main allocator: hands out an erased block together with the erase
    /// count to stamp on its first write.
    ///
    /// The reserved tail of the table is reachable only with `access_rsvd`,
    /// which is the fold path's privilege; that path also skips the refill
    /// and the temporary commit, both of which append to the meta block.
    pub fn get_erased_blk(&mut self, access_rsvd: bool) -> Result<(u32, u32), FtlErr>
    {
        loop {
            if !access_rsvd {
                // Best effort: selection below fails only if nothing usable.
                let _ = self.avail_tbl_fill(self.rsvd_cnt as usize + 1);

                // No temporary commit before the first metadata block exists
                // (low-level format) -- the full commit that follows covers it.
                if self.meta_blk_ix != BLK_IX_INVALID && self.meta_invalid_map.get(0) {
                    self.meta_commit(true)?;
                }
            }

            let limit = if access_rsvd {
                self.avail_cnt as usize
            } else {
                (self.avail_cnt - self.rsvd_cnt) as usize
            };

            // Lowest effective erase count wins; committed entries are
            // preferred unless an uncommitted one is strictly lower. Stale
            // meta candidates count as zero so they are recycled before
            // their sequence ID can drift out of the comparison window.
            let mut best_com: Option<(usize, u32)> = None;
            let mut best_unc: Option<(usize, u32)> = None;

            for ix in 0..limit {
                let entry = self.avail_tbl[ix];
                if entry.is_free() {
                    continue;
                }

                let stale = self.avail_meta_map.get(ix)
                    && self.meta_blk_id.wrapping_sub(self.avail_meta_id[ix]) > META_ID_QUARTER;
                let eff = if stale { 0 } else { entry.erase_cnt };

                let best = if self.avail_commit_map.get(ix) {
                    &mut best_com
                } else {
                    &mut best_unc
                };

                let better = match *best {
                    Some((_, b)) => eff < b,
                    None => true,
                };
                if better {
                    *best = Some((ix, eff));
                }
            }

            let chosen = match (best_com, best_unc) {
                (Some(c), Some(u)) => if u.1 < c.1 { u } else { c },
                (Some(c), None) => c,
                (None, Some(u)) => u,
                (None, None) => return Err(FtlErr::NoAvailBlk),
            };

            let blk = self.avail_tbl[chosen.0].blk_ix;
            let erase_cnt_next = self.avail_blk_remove(blk).unwrap();

            if self.sec_is_used(blk, 0)? {
                match self.ctrlr.blk_erase(blk) {
                    Ok(()) => (),
                    Err(CtrlrErr::Io) => {
                        self.blk_mark_bad(blk)?;
                        continue;
                    }
                    Err(CtrlrErr::Timeout) => return Err(FtlErr::DevTimeout),
                }
            }

            return Ok((blk, erase_cnt_next));
        }
    }
}
