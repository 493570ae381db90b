use crate::bitmap::{Bitmap, PackedArr};
use crate::error::FtlErr;
use crate::nand::Ctrlr;
use super::{NandDev, BLK_IX_INVALID, ERASE_CNT_INVALID, SEC_OFFSET_INVALID};
use super::oos::{self, StorageOos};

/// One slot of the update-block table. The valid map flags, per physical
/// sector offset, the authoritative copy of some logical sector.
#[derive(Clone, Debug)]
pub struct UbTblEntry {
    pub blk_ix: u32,
    pub valid_map: Bitmap,
}

/// RAM-only per-update-block state, rebuilt from the block contents at
/// mount. `assoc_lvl == 0` marks a SUB: exactly one implicit associate in
/// `assoc[0]`, physical offsets equal to logical offsets.
#[derive(Clone, Debug)]
pub struct UbExtra {
    pub assoc: Vec<u32>,
    pub assoc_lvl: u32,
    pub next_sec_ix: u32,
    pub activity_ctr: u32,
    pub erase_cnt_next: u32,
    pub subset_map: Option<PackedArr>,
    pub meta_cache: Option<PackedArr>,
}

impl UbExtra {
    pub fn empty(k_max: usize) -> Self
    {
        Self {
            assoc: vec![BLK_IX_INVALID; k_max],
            assoc_lvl: 1,
            next_sec_ix: 0,
            activity_ctr: 0,
            erase_cnt_next: ERASE_CNT_INVALID,
            subset_map: None,
            meta_cache: None,
        }
    }
}

/// Location of the latest copy of a logical sector.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SecLoc {
    Ub { ub_ix: usize, sec_offset_phy: u32 },
    Data { blk_ix: u32 },
    None,
}

impl<C: Ctrlr> NandDev<C> {
    pub fn blk_is_ub(&self, blk_ix: u32) -> bool
    {
        self.ub_tbl.iter().any(|e| e.blk_ix == blk_ix)
    }

    pub fn ub_is_sub(&self, ub_ix: usize) -> bool
    {
        self.ub_tbl[ub_ix].blk_ix != BLK_IX_INVALID && self.ub_extra[ub_ix].assoc_lvl == 0
    }

    /// The update block mirroring a logical block, if any.
    pub fn ub_find(&self, lb_ix: u32) -> Option<usize>
    {
        for u in 0..self.ub_cnt as usize {
            if self.ub_tbl[u].blk_ix == BLK_IX_INVALID {
                continue;
            }

            let extra = &self.ub_extra[u];
            let hit = if extra.assoc_lvl == 0 {
                extra.assoc[0] == lb_ix
            } else {
                extra.assoc[..extra.assoc_lvl as usize].contains(&lb_ix)
            };

            if hit {
                return Some(u);
            }
        }

        None
    }

    fn ub_assoc_ix(&self, ub_ix: usize, lb_ix: u32) -> Option<u32>
    {
        let extra = &self.ub_extra[ub_ix];
        let lvl = extra.assoc_lvl.max(1) as usize;

        extra.assoc[..lvl].iter().position(|a| *a == lb_ix).map(|p| p as u32)
    }

    fn ub_idle(&self, ub_ix: usize) -> u32
    {
        self.activity_ctr.wrapping_sub(self.ub_extra[ub_ix].activity_ctr)
    }

    /// Merge priority: the fuller and staler an update block, the sooner it
    /// goes. Completely full blocks jump the queue.
    fn ub_merge_priority(&self, ub_ix: usize) -> u32
    {
        let next = self.ub_extra[ub_ix].next_sec_ix;

        if next >= self.spb {
            u32::MAX
        } else {
            next.saturating_add(self.ub_idle(ub_ix) / self.ub_cnt)
        }
    }

    // Bit widths of the packed per-sector tag: logical offset plus
    // associate index.
    fn ub_tag_off_bits(&self) -> u32
    {
        crate::util::log2(self.spb).max(1)
    }

    fn ub_tag_width(&self) -> u32
    {
        let assoc_bits = (32 - (self.k_max.max(2) - 1).leading_zeros()).max(1);

        self.ub_tag_off_bits() + assoc_bits
    }

    fn ub_subset_width(&self) -> u32
    {
        let subsets = self.spb / self.cfg.ub_tbl_subset_size.max(1);

        crate::util::log2(subsets.max(2))
    }

    fn ub_caches_new(&self) -> (Option<PackedArr>, Option<PackedArr>)
    {
        let subset_map = if self.cfg.ub_tbl_subset_size != 0 {
            Some(PackedArr::new(
                self.k_max as usize * self.spb as usize,
                self.ub_subset_width(),
            ))
        } else {
            None
        };

        let meta_cache = if self.cfg.ub_meta_cache_en {
            Some(PackedArr::new(self.spb as usize, self.ub_tag_width()))
        } else {
            None
        };

        (subset_map, meta_cache)
    }

    fn ub_cache_update(&mut self, ub_ix: usize, phys: u32, off: u32, assoc_ix: u32)
    {
        let off_bits = self.ub_tag_off_bits();
        let subset_size = self.cfg.ub_tbl_subset_size;
        let spb = self.spb;
        let extra = &mut self.ub_extra[ub_ix];

        if let Some(cache) = extra.meta_cache.as_mut() {
            cache.set(phys as usize, (assoc_ix << off_bits) | off);
        }
        if let Some(subset) = extra.subset_map.as_mut() {
            let ix = assoc_ix as usize * spb as usize + off as usize;
            subset.set(ix, phys / subset_size);
        }
    }

    /// The (logical offset, associate index) tag of a written physical
    /// sector, from the meta cache when enabled, re-read from the OOS
    /// otherwise.
    fn ub_sec_tag(&mut self, ub_ix: usize, phys: u32) -> Result<(u32, u32), FtlErr>
    {
        if let Some(cache) = &self.ub_extra[ub_ix].meta_cache {
            let val = cache.get(phys as usize);
            let off_bits = self.ub_tag_off_bits();
            let off = val & ((1 << off_bits) - 1);

            return Ok((off, val >> off_bits));
        }

        let blk = self.ub_tbl[ub_ix].blk_ix;
        let mut data = vec![0u8; self.sec_size as usize];
        let mut oos_buf = vec![0u8; self.oos_size as usize];

        match self.sec_rd_phy_no_refresh(blk, phys, &mut data, &mut oos_buf) {
            Ok(true) => (),
            Ok(false) => return Ok((SEC_OFFSET_INVALID, BLK_IX_INVALID)),
            Err(FtlErr::EccUncorr) => return Ok((SEC_OFFSET_INVALID, BLK_IX_INVALID)),
            Err(e) => return Err(e),
        }

        let img = match oos::storage_oos_rd(&oos_buf) {
            Ok(img) => img,
            Err(_) => return Ok((SEC_OFFSET_INVALID, BLK_IX_INVALID)),
        };

        match self.ub_assoc_ix(ub_ix, img.blk_ix_logical) {
            Some(a) => Ok((img.sec_offset_logical, a)),
            None => Ok((SEC_OFFSET_INVALID, BLK_IX_INVALID)),
        }
    }

    /// Finds the physical offset holding the latest copy of a logical
    /// sector inside an update block.
    pub fn ub_sec_find(&mut self, ub_ix: usize, lb_ix: u32, off: u32)
        -> Result<Option<u32>, FtlErr>
    {
        let extra = &self.ub_extra[ub_ix];

        if extra.assoc_lvl == 0 {
            // SUB: offsets are aligned by construction.
            if extra.assoc[0] == lb_ix
                && off < extra.next_sec_ix
                && self.ub_tbl[ub_ix].valid_map.get(off as usize)
            {
                return Ok(Some(off));
            }
            return Ok(None);
        }

        let assoc_ix = match self.ub_assoc_ix(ub_ix, lb_ix) {
            Some(a) => a,
            None => return Ok(None),
        };

        let next = extra.next_sec_ix;
        let subset_size = self.cfg.ub_tbl_subset_size;

        let (lo, hi) = match &extra.subset_map {
            Some(subset) if subset_size != 0 => {
                let s = subset.get(assoc_ix as usize * self.spb as usize + off as usize);
                let lo = s * subset_size;
                (lo.min(next), (lo + subset_size).min(next))
            }
            _ => (0, next),
        };

        // Latest write wins by append order: walk downward, first hit is it.
        for phys in (lo..hi).rev() {
            if !self.ub_tbl[ub_ix].valid_map.get(phys as usize) {
                continue;
            }

            let (tag_off, tag_assoc) = self.ub_sec_tag(ub_ix, phys)?;
            if tag_off == off && tag_assoc == assoc_ix {
                return Ok(Some(phys));
            }
        }

        Ok(None)
    }

    /// Resolves the latest copy of a logical sector: update block first,
    /// then the backing data block, then nowhere.
    pub fn sec_find(&mut self, lb_ix: u32, off: u32) -> Result<SecLoc, FtlErr>
    {
        if let Some(ub_ix) = self.ub_find(lb_ix) {
            if let Some(p) = self.ub_sec_find(ub_ix, lb_ix, off)? {
                return Ok(SecLoc::Ub { ub_ix, sec_offset_phy: p });
            }
        }

        let blk_ix = self.l2p[lb_ix as usize];
        if blk_ix != BLK_IX_INVALID && self.sec_is_used(blk_ix, off)? {
            return Ok(SecLoc::Data { blk_ix });
        }

        Ok(SecLoc::None)
    }

    fn ub_slot_reset(&mut self, ub_ix: usize)
    {
        self.ub_tbl[ub_ix].blk_ix = BLK_IX_INVALID;
        self.ub_tbl[ub_ix].valid_map.clear_all();
        self.ub_extra[ub_ix] = UbExtra::empty(self.k_max as usize);
        self.meta_invalidate_ub_entry(ub_ix);
    }

    /// Clears an update-block slot, dropping its SUB accounting if needed.
    pub fn ub_clr(&mut self, ub_ix: usize)
    {
        if self.ub_is_sub(ub_ix) {
            self.sub_cnt -= 1;
        }

        self.ub_slot_reset(ub_ix);
    }

    /// Creates a fresh update block in an empty slot, associated with one
    /// logical block.
    fn ub_create(&mut self, ub_ix: usize, lb_ix: u32, sub: bool) -> Result<(), FtlErr>
    {
        debug_assert!(self.ub_tbl[ub_ix].blk_ix == BLK_IX_INVALID);

        let (blk, erase_cnt) = self.get_erased_blk(false)?;

        let mut extra = UbExtra::empty(self.k_max as usize);
        extra.assoc[0] = lb_ix;
        extra.assoc_lvl = if sub { 0 } else { 1 };
        extra.erase_cnt_next = erase_cnt;
        extra.activity_ctr = self.activity_ctr;

        let (subset_map, meta_cache) = self.ub_caches_new();
        extra.subset_map = subset_map;
        extra.meta_cache = meta_cache;

        self.ub_tbl[ub_ix].blk_ix = blk;
        self.ub_tbl[ub_ix].valid_map.clear_all();
        self.ub_extra[ub_ix] = extra;

        if sub {
            self.sub_cnt += 1;
        }

        self.meta_invalidate_ub_entry(ub_ix);
        self.logger.log(2, &format!(
            "{} opened in slot {} (block {}) for logical block {}",
            if sub { "SUB" } else { "RUB" }, ub_ix, blk, lb_ix,
        ));

        Ok(())
    }

    /// Appends one logical sector into an update block. For a SUB the
    /// physical offset is the logical offset; for a RUB it is the append
    /// point. Bookkeeping happens only after the program succeeded, so an
    /// `OpAborted` retry is safe.
    pub fn ub_sec_wr(&mut self, ub_ix: usize, lb_ix: u32, off: u32, data: &[u8])
        -> Result<(), FtlErr>
    {
        let is_sub = self.ub_is_sub(ub_ix);
        let next = self.ub_extra[ub_ix].next_sec_ix;
        let phys = if is_sub { off } else { next };

        debug_assert!(phys < self.spb);
        debug_assert!(!is_sub || off >= next);

        let prev = if is_sub {
            None
        } else {
            self.ub_sec_find(ub_ix, lb_ix, off)?
        };

        let erase_cnt = if phys == 0 {
            self.ub_extra[ub_ix].erase_cnt_next
        } else {
            ERASE_CNT_INVALID
        };

        let img = StorageOos::new(erase_cnt, lb_ix, off);
        let mut oos_buf = vec![0xffu8; self.oos_size as usize];
        oos::storage_oos_wr(&mut oos_buf, &img, self.ecc_strength)?;

        self.sec_wr_handler(self.lb_alias_ub(ub_ix), phys, data, &oos_buf)?;

        self.activity_ctr = self.activity_ctr.wrapping_add(1);
        let ctr = self.activity_ctr;
        let extra = &mut self.ub_extra[ub_ix];
        extra.next_sec_ix = phys + 1;
        extra.activity_ctr = ctr;

        self.ub_tbl[ub_ix].valid_map.set(phys as usize);
        if let Some(p) = prev {
            self.ub_tbl[ub_ix].valid_map.clear(p as usize);
        }

        if !is_sub {
            let assoc_ix = self.ub_assoc_ix(ub_ix, lb_ix).unwrap();
            self.ub_cache_update(ub_ix, phys, off, assoc_ix);
        }

        self.meta_invalidate_ub_entry(ub_ix);

        Ok(())
    }

    /// Promotes a SUB to a single-associate RUB. Offsets written so far stay
    /// aligned; new appends are free to diverge.
    fn sub_to_rub(&mut self, ub_ix: usize) -> Result<(), FtlErr>
    {
        debug_assert!(self.ub_is_sub(ub_ix));

        self.ub_extra[ub_ix].assoc_lvl = 1;
        self.sub_cnt -= 1;
        self.ub_caches_rebuild(ub_ix)?;

        self.logger.log(2, &format!("SUB in slot {} promoted to RUB", ub_ix));

        Ok(())
    }

    /// Rebuilds the search caches of an update block from its sectors'
    /// OOS tags.
    fn ub_caches_rebuild(&mut self, ub_ix: usize) -> Result<(), FtlErr>
    {
        let (subset_map, meta_cache) = self.ub_caches_new();
        self.ub_extra[ub_ix].subset_map = subset_map;
        self.ub_extra[ub_ix].meta_cache = meta_cache;

        if self.ub_extra[ub_ix].subset_map.is_none()
            && self.ub_extra[ub_ix].meta_cache.is_none()
        {
            return Ok(());
        }

        let blk = self.ub_tbl[ub_ix].blk_ix;
        let next = self.ub_extra[ub_ix].next_sec_ix;
        let mut data = vec![0u8; self.sec_size as usize];
        let mut oos_buf = vec![0u8; self.oos_size as usize];

        for phys in 0..next {
            if !self.ub_tbl[ub_ix].valid_map.get(phys as usize) {
                continue;
            }

            let used = match self.sec_rd_phy_no_refresh(blk, phys, &mut data, &mut oos_buf) {
                Ok(u) => u,
                Err(FtlErr::EccUncorr) => continue,
                Err(e) => return Err(e),
            };
            if !used {
                continue;
            }

            if let Ok(img) = oos::storage_oos_rd(&oos_buf) {
                if let Some(assoc_ix) = self.ub_assoc_ix(ub_ix, img.blk_ix_logical) {
                    self.ub_cache_update(ub_ix, phys, img.sec_offset_logical, assoc_ix);
                }
            }
        }

        Ok(())
    }

    /// Copies the current effective content of one associate into a fresh
    /// data block and drops the associate from the update block. The
    /// logical-to-physical entry is swapped to the target up front so the
    /// write helper addresses it, and restored if the merge dies.
    pub fn rub_partial_merge(&mut self, ub_ix: usize, lb_ix: u32) -> Result<(), FtlErr>
    {
        debug_assert!(!self.ub_is_sub(ub_ix));

        let old_blk = self.l2p[lb_ix as usize];

        // The update block's contribution, fixed before any copying.
        let mut ub_src: Vec<Option<u32>> = Vec::with_capacity(self.spb as usize);
        for off in 0..self.spb {
            ub_src.push(self.ub_sec_find(ub_ix, lb_ix, off)?);
        }

        let (dst_blk, dst_cnt) = match self.get_erased_blk(false) {
            Ok(v) => v,
            Err(e) => return Err(e),
        };
        self.l2p[lb_ix as usize] = dst_blk;

        for off in 0..self.spb {
            let mut data = vec![0u8; self.sec_size as usize];
            let mut src_oos = vec![0u8; self.oos_size as usize];

            let have = if let Some(phys) = ub_src[off as usize] {
                let ub_blk = self.ub_tbl[ub_ix].blk_ix;
                match self.sec_rd_phy_no_refresh(ub_blk, phys, &mut data, &mut src_oos) {
                    Ok(used) => used,
                    Err(FtlErr::EccUncorr) => {
                        self.logger.log(0, &format!(
                            "merge: data loss in block {} sector {}", ub_blk, phys,
                        ));
                        true
                    }
                    Err(e) => {
                        self.l2p[lb_ix as usize] = old_blk;
                        return Err(e);
                    }
                }
            } else if old_blk != BLK_IX_INVALID && self.sec_is_used(old_blk, off)? {
                match self.sec_rd_phy_no_refresh(old_blk, off, &mut data, &mut src_oos) {
                    Ok(used) => used,
                    Err(FtlErr::EccUncorr) => {
                        self.logger.log(0, &format!(
                            "merge: data loss in block {} sector {}", old_blk, off,
                        ));
                        true
                    }
                    Err(e) => {
                        self.l2p[lb_ix as usize] = old_blk;
                        return Err(e);
                    }
                }
            } else {
                false
            };

            if !have && off != 0 {
                continue;
            }

            // Offset 0 always carries the erase count, in a dummy sector if
            // neither source had it.
            let cnt = if off == 0 { dst_cnt } else { ERASE_CNT_INVALID };
            let img = if have {
                StorageOos::new(cnt, lb_ix, off)
            } else {
                StorageOos::dummy(cnt, lb_ix)
            };
            let mut oos_buf = vec![0xffu8; self.oos_size as usize];
            oos::storage_oos_wr(&mut oos_buf, &img, self.ecc_strength)?;

            let mut written = false;
            for _ in 0..=self.max_bad {
                match self.sec_wr_handler(lb_ix, off, &data, &oos_buf) {
                    Ok(()) => {
                        written = true;
                        break;
                    }
                    // The handler moved the partial target onto a fresh
                    // block and repointed the map; write the sector again.
                    Err(FtlErr::OpAborted) => continue,
                    Err(e) => {
                        self.l2p[lb_ix as usize] = old_blk;
                        return Err(e);
                    }
                }
            }
            if !written {
                self.l2p[lb_ix as usize] = old_blk;
                return Err(FtlErr::OpAborted);
            }
        }

        // Release the update block's copies and the associate.
        for off in 0..self.spb {
            if let Some(phys) = ub_src[off as usize] {
                self.ub_tbl[ub_ix].valid_map.clear(phys as usize);
            }
        }
        self.meta_invalidate_ub_entry(ub_ix);

        let lvl = self.ub_extra[ub_ix].assoc_lvl;
        if lvl <= 1 {
            let ub_blk = self.ub_tbl[ub_ix].blk_ix;
            self.dirty_bit_set(ub_blk);
            self.ub_clr(ub_ix);
        } else {
            let extra = &mut self.ub_extra[ub_ix];
            let pos = extra.assoc[..lvl as usize]
                .iter()
                .position(|a| *a == lb_ix)
                .unwrap();
            for i in pos..lvl as usize - 1 {
                extra.assoc[i] = extra.assoc[i + 1];
            }
            extra.assoc[lvl as usize - 1] = BLK_IX_INVALID;
            extra.assoc_lvl = lvl - 1;
        }

        if old_blk != BLK_IX_INVALID {
            self.dirty_bit_set(old_blk);
        }

        self.logger.log(2, &format!(
            "logical block {} merged onto block {}", lb_ix, self.l2p[lb_ix as usize],
        ));

        Ok(())
    }

    /// Full merge of a RUB: one partial merge per associate; the last one
    /// releases the slot.
    pub fn rub_merge(&mut self, ub_ix: usize) -> Result<(), FtlErr>
    {
        let lvl = self.ub_extra[ub_ix].assoc_lvl as usize;
        let assoc: Vec<u32> = self.ub_extra[ub_ix].assoc[..lvl].to_vec();

        for lb_ix in assoc {
            self.rub_partial_merge(ub_ix, lb_ix)?;
        }

        Ok(())
    }

    /// Copies the old data block's sectors in `[next_sec_ix, end]` into the
    /// SUB at their aligned offsets. Pure data motion; absent sources are
    /// skipped and the append point jumps past the range.
    pub fn sub_merge_until(&mut self, ub_ix: usize, end: u32) -> Result<(), FtlErr>
    {
        debug_assert!(self.ub_is_sub(ub_ix));
        debug_assert!(end < self.spb);

        let lb_ix = self.ub_extra[ub_ix].assoc[0];
        let old_blk = self.l2p[lb_ix as usize];
        let start = self.ub_extra[ub_ix].next_sec_ix;

        for off in start..=end {
            if old_blk == BLK_IX_INVALID || !self.sec_is_used(old_blk, off)? {
                continue;
            }

            let mut data = vec![0u8; self.sec_size as usize];
            let mut src_oos = vec![0u8; self.oos_size as usize];
            match self.sec_rd_phy_no_refresh(old_blk, off, &mut data, &mut src_oos) {
                Ok(_) => (),
                Err(FtlErr::EccUncorr) => {
                    self.logger.log(0, &format!(
                        "merge: data loss in block {} sector {}", old_blk, off,
                    ));
                }
                Err(e) => return Err(e),
            }

            let cnt = if off == 0 {
                self.ub_extra[ub_ix].erase_cnt_next
            } else {
                ERASE_CNT_INVALID
            };
            let img = StorageOos::new(cnt, lb_ix, off);
            let mut oos_buf = vec![0xffu8; self.oos_size as usize];
            oos::storage_oos_wr(&mut oos_buf, &img, self.ecc_strength)?;

            let mut written = false;
            for _ in 0..=self.max_bad {
                match self.sec_wr_handler(self.lb_alias_ub(ub_ix), off, &data, &oos_buf) {
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

            self.ub_tbl[ub_ix].valid_map.set(off as usize);
        }

        let extra = &mut self.ub_extra[ub_ix];
        extra.next_sec_ix = extra.next_sec_ix.max(end + 1);
        self.meta_invalidate_ub_entry(ub_ix);

        Ok(())
    }

    /// Merges a SUB: tops it up from the old data block, then points the
    /// logical block at the SUB's own physical block. No copying of the
    /// already-sequential content.
    pub fn sub_merge(&mut self, ub_ix: usize) -> Result<(), FtlErr>
    {
        debug_assert!(self.ub_is_sub(ub_ix));

        self.sub_merge_until(ub_ix, self.spb - 1)?;

        let lb_ix = self.ub_extra[ub_ix].assoc[0];
        let sub_blk = self.ub_tbl[ub_ix].blk_ix;
        let old_blk = self.l2p[lb_ix as usize];

        self.l2p[lb_ix as usize] = sub_blk;
        if old_blk != BLK_IX_INVALID {
            self.dirty_bit_set(old_blk);
        }

        self.ub_clr(ub_ix);

        self.logger.log(2, &format!(
            "SUB merged: logical block {} now backed by block {}", lb_ix, sub_blk,
        ));

        Ok(())
    }

    /// Allocation decision for a logical block with no usable update block.
    /// One ordered policy; only the created block's flavor follows the
    /// caller's intent (`sequential`, within the SUB cap):
    ///
    /// 1. a completely full SUB is merged away (its merge is free) and the
    ///    slot reused;
    /// 2. an empty slot is taken, unless a sequential caller is already at
    ///    the SUB cap;
    /// 3. a RUB below its associativity cap adopts the block;
    /// 4. a spacious, idle SUB is promoted to a RUB and adopts the block;
    /// 5. the fullest SUB is evicted when it is nearly done, or when no RUB
    ///    exists to evict instead;
    /// 6. otherwise the RUB with the highest merge priority is evicted.
    fn ub_alloc(&mut self, lb_ix: u32, sequential: bool) -> Result<usize, FtlErr>
    {
        let ub_cnt = self.ub_cnt as usize;

        for u in 0..ub_cnt {
            if self.ub_is_sub(u) && self.ub_extra[u].next_sec_ix >= self.spb {
                self.sub_merge(u)?;
                let sub = sequential && self.sub_cnt < self.sub_cap;
                self.ub_create(u, lb_ix, sub)?;
                return Ok(u);
            }
        }

        if !sequential || self.sub_cnt < self.sub_cap {
            if let Some(u) = (0..ub_cnt).find(|u| self.ub_tbl[*u].blk_ix == BLK_IX_INVALID) {
                self.ub_create(u, lb_ix, sequential)?;
                return Ok(u);
            }
        }

        // Join an existing RUB below its associativity cap.
        for u in 0..ub_cnt {
            if self.ub_tbl[u].blk_ix == BLK_IX_INVALID || self.ub_is_sub(u) {
                continue;
            }
            if self.ub_extra[u].assoc_lvl < self.k_max
                && self.ub_extra[u].next_sec_ix < self.spb
            {
                let lvl = self.ub_extra[u].assoc_lvl as usize;
                self.ub_extra[u].assoc[lvl] = lb_ix;
                self.ub_extra[u].assoc_lvl += 1;
                return Ok(u);
            }
        }

        // Promote a spacious, idle SUB and join it.
        if self.k_max > 1 {
            for u in 0..ub_cnt {
                if !self.ub_is_sub(u) {
                    continue;
                }
                let free = self.spb - self.ub_extra[u].next_sec_ix;
                if free >= self.th_convert_sub_to_rub
                    && self.ub_idle(u) > self.cfg.th_sub_min_idle_to_fold
                {
                    self.sub_to_rub(u)?;
                    self.ub_extra[u].assoc[1] = lb_ix;
                    self.ub_extra[u].assoc_lvl = 2;
                    return Ok(u);
                }
            }
        }

        // Evict the fullest SUB when it is nearly done or when every slot
        // is sequential.
        let fullest_sub = (0..ub_cnt)
            .filter(|u| self.ub_is_sub(*u))
            .max_by_key(|u| self.ub_extra[*u].next_sec_ix);
        let have_rub = (0..ub_cnt)
            .any(|u| self.ub_tbl[u].blk_ix != BLK_IX_INVALID && !self.ub_is_sub(u));

        if let Some(u) = fullest_sub {
            let free = self.spb - self.ub_extra[u].next_sec_ix;
            if free < self.th_merge_sub || !have_rub {
                self.sub_merge(u)?;
                let sub = sequential && self.sub_cnt < self.sub_cap;
                self.ub_create(u, lb_ix, sub)?;
                return Ok(u);
            }
        }

        // Evict the RUB with the highest merge priority.
        let victim = (0..ub_cnt)
            .filter(|u| self.ub_tbl[*u].blk_ix != BLK_IX_INVALID && !self.ub_is_sub(*u))
            .max_by_key(|u| self.ub_merge_priority(*u));

        match victim {
            Some(u) => {
                self.rub_merge(u)?;
                let sub = sequential && self.sub_cnt < self.sub_cap;
                self.ub_create(u, lb_ix, sub)?;
                Ok(u)
            }
            None => Err(FtlErr::InvalidMetadata),
        }
    }

    /// Writes one logical sector through the update-block machinery.
    /// `seq_cnt` is the number of sectors the caller is writing contiguously
    /// from this one; it steers the RUB/SUB decision at offset 0.
    pub fn sec_wr_logical(&mut self, lb_ix: u32, off: u32, data: &[u8], seq_cnt: u32)
        -> Result<(), FtlErr>
    {
        match self.ub_find(lb_ix) {
            Some(u) if self.ub_is_sub(u) => {
                let next = self.ub_extra[u].next_sec_ix;
                let free = self.spb - next;

                if off == next {
                    self.ub_sec_wr(u, lb_ix, off, data)
                } else if off < next {
                    // Overwrite inside the sequential run.
                    if free >= self.th_convert_sub_to_rub {
                        self.sub_to_rub(u)?;
                        self.ub_sec_wr(u, lb_ix, off, data)
                    } else {
                        self.sub_merge(u)?;
                        let nu = self.ub_alloc(lb_ix, false)?;
                        self.ub_sec_wr(nu, lb_ix, off, data)
                    }
                } else {
                    let gap = off - next;

                    if gap < self.th_pad_sub {
                        self.sub_merge_until(u, off - 1)?;
                        self.ub_sec_wr(u, lb_ix, off, data)
                    } else if free >= self.th_convert_sub_to_rub {
                        self.sub_to_rub(u)?;
                        self.ub_sec_wr(u, lb_ix, off, data)
                    } else {
                        self.sub_merge_until(u, off - 1)?;
                        self.ub_sec_wr(u, lb_ix, off, data)
                    }
                }
            }
            Some(u) => {
                let full = self.ub_extra[u].next_sec_ix >= self.spb;
                let start_sub = off == 0 && seq_cnt >= self.th_merge_rub_start_sub;

                if start_sub {
                    // A long rewrite from offset 0: take the block out of
                    // the RUB and restart it sequentially.
                    self.rub_partial_merge(u, lb_ix)?;
                    let nu = self.ub_alloc(lb_ix, true)?;
                    self.ub_sec_wr(nu, lb_ix, off, data)
                } else if full {
                    self.rub_merge(u)?;
                    let nu = self.ub_alloc(lb_ix, false)?;
                    self.ub_sec_wr(nu, lb_ix, off, data)
                } else {
                    self.ub_sec_wr(u, lb_ix, off, data)
                }
            }
            None => {
                let sequential = off == 0 && seq_cnt >= self.th_merge_rub_start_sub;
                let nu = self.ub_alloc(lb_ix, sequential)?;

                self.ub_sec_wr(nu, lb_ix, off, data)
            }
        }
    }

    /// Rebuilds an update block's extra data from its contents at mount.
    /// The committed valid map is authoritative: appends newer than the
    /// last finished commit are discarded, but the append point honors them
    /// so no sector is ever reprogrammed.
    pub fn ub_load(&mut self, ub_ix: usize) -> Result<(), FtlErr>
    {
        let blk = self.ub_tbl[ub_ix].blk_ix;
        let next = self.blk_next_sec_ix_find(blk)?;

        let mut assoc_seen: Vec<u32> = Vec::new();
        let mut aligned = true;
        let mut tags: Vec<(u32, u32, u32)> = Vec::new();

        let mut data = vec![0u8; self.sec_size as usize];
        let mut oos_buf = vec![0u8; self.oos_size as usize];

        for phys in 0..self.spb {
            if !self.ub_tbl[ub_ix].valid_map.get(phys as usize) {
                continue;
            }

            // A committed valid bit must have a written sector under it.
            if phys >= next {
                self.ub_tbl[ub_ix].valid_map.clear(phys as usize);
                continue;
            }

            let used = match self.sec_rd_phy_no_refresh(blk, phys, &mut data, &mut oos_buf) {
                Ok(u) => u,
                Err(FtlErr::EccUncorr) => {
                    self.logger.log(0, &format!(
                        "mount: unreadable sector {} in update block {}", phys, blk,
                    ));
                    self.ub_tbl[ub_ix].valid_map.clear(phys as usize);
                    continue;
                }
                Err(e) => return Err(e),
            };
            if !used {
                self.ub_tbl[ub_ix].valid_map.clear(phys as usize);
                continue;
            }

            let img = match oos::storage_oos_rd(&oos_buf) {
                Ok(img) => img,
                Err(_) => {
                    self.ub_tbl[ub_ix].valid_map.clear(phys as usize);
                    continue;
                }
            };
            if img.is_dummy() || img.blk_ix_logical >= self.n_data {
                self.ub_tbl[ub_ix].valid_map.clear(phys as usize);
                continue;
            }

            if !assoc_seen.contains(&img.blk_ix_logical) {
                assoc_seen.push(img.blk_ix_logical);
            }
            if img.sec_offset_logical != phys {
                aligned = false;
            }
            tags.push((phys, img.blk_ix_logical, img.sec_offset_logical));
        }

        if tags.is_empty() {
            // Nothing committed lives here; reclaim the block.
            self.dirty_bit_set(blk);
            self.ub_slot_reset(ub_ix);
            return Ok(());
        }

        if assoc_seen.len() > self.k_max as usize {
            return Err(FtlErr::InvalidMetadata);
        }

        let is_sub = aligned && assoc_seen.len() == 1;

        let mut extra = UbExtra::empty(self.k_max as usize);
        extra.next_sec_ix = next;
        extra.activity_ctr = self.activity_ctr;

        if is_sub {
            extra.assoc_lvl = 0;
            extra.assoc[0] = assoc_seen[0];
            self.sub_cnt += 1;
        } else {
            extra.assoc_lvl = assoc_seen.len() as u32;
            for (i, lb) in assoc_seen.iter().enumerate() {
                extra.assoc[i] = *lb;
            }
        }

        let (subset_map, meta_cache) = self.ub_caches_new();
        extra.subset_map = subset_map;
        extra.meta_cache = meta_cache;
        self.ub_extra[ub_ix] = extra;

        if !is_sub {
            for (phys, lb, off) in tags {
                let assoc_ix = self.ub_assoc_ix(ub_ix, lb).unwrap();
                self.ub_cache_update(ub_ix, phys, off, assoc_ix);
            }
        }

        Ok(())
    }
}
