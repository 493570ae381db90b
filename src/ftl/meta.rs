use bincode::Options;

use crate::bitmap::Bitmap;
use crate::ceil_div;
use crate::error::FtlErr;
use crate::nand::{Ctrlr, CtrlrErr};
use super::{NandDev, BLK_IX_INVALID, ERASE_CNT_INVALID, META_ID_HALF};
use super::avail::AvailEntry;
use super::oos::{self, bincode_opt, MetaOos, SecType, SeqStatus, StorageOos};

// The metadata image is the concatenation, in this order, of the available
// table (padded to exactly one sector), the bad-block table, the dirty
// bitmap and the update-block table. It is committed in sector-size chunks,
// appended to the active metadata block; "invalid" sectors are those whose
// in-RAM content is newer than the last committed copy.

impl<C: Ctrlr> NandDev<C> {
    pub fn ub_entry_size(&self) -> usize
    {
        4 + ceil_div!(self.spb as usize, 8)
    }

    /// Marks the meta sectors covering an image byte range for re-commit.
    pub fn meta_invalidate(&mut self, off: usize, len: usize)
    {
        if len == 0 {
            return;
        }

        let first = off / self.sec_size as usize;
        let last = (off + len - 1) / self.sec_size as usize;

        for sec in first..=last {
            self.meta_invalid_map.set(sec);
        }
    }

    pub fn meta_invalidate_ub_entry(&mut self, ub_ix: usize)
    {
        let size = self.ub_entry_size();
        let off = self.off_ub + ub_ix * size;

        self.meta_invalidate(off, size);
    }

    pub fn blk_is_dirty(&self, blk_ix: u32) -> bool
    {
        self.dirty_map.get(blk_ix as usize)
    }

    pub fn dirty_bit_set(&mut self, blk_ix: u32)
    {
        self.dirty_map.set(blk_ix as usize);
        self.dirty_invalidate(blk_ix);
    }

    pub fn dirty_bit_clr(&mut self, blk_ix: u32)
    {
        self.dirty_map.clear(blk_ix as usize);
        self.dirty_invalidate(blk_ix);
    }

    // With the committed-image shadow enabled, a bit that toggles back to
    // its committed value costs nothing at the next commit.
    fn dirty_invalidate(&mut self, blk_ix: u32)
    {
        if let Some(shadow) = &self.dirty_map_committed {
            if shadow.get(blk_ix as usize) == self.dirty_map.get(blk_ix as usize) {
                return;
            }
        }

        let off = self.off_dirty + blk_ix as usize / 8;
        self.meta_invalidate(off, 1);
    }

    /// Serializes the complete metadata image from the in-RAM tables.
    pub fn meta_img_build(&self) -> Vec<u8>
    {
        let mut img = vec![0u8; self.meta_sec_cnt as usize * self.sec_size as usize];

        for i in 0..self.avail_cnt as usize {
            let entry = self.avail_entry_rd(i);
            bincode_opt()
                .serialize_into(&mut img[i * 8..(i + 1) * 8], &entry)
                .expect("available-table entry fits its slot");
        }

        for i in 0..self.max_bad as usize {
            let val = self.bad_tbl.get(i).copied().unwrap_or(BLK_IX_INVALID);
            img[self.off_bad + i * 4..self.off_bad + (i + 1) * 4]
                .copy_from_slice(&val.to_le_bytes());
        }

        let dirty = self.dirty_map.as_bytes();
        img[self.off_dirty..self.off_dirty + dirty.len()].copy_from_slice(dirty);

        let esize = self.ub_entry_size();
        for (u, entry) in self.ub_tbl.iter().enumerate() {
            let off = self.off_ub + u * esize;
            img[off..off + 4].copy_from_slice(&entry.blk_ix.to_le_bytes());
            let map = entry.valid_map.as_bytes();
            img[off + 4..off + 4 + map.len()].copy_from_slice(map);
        }

        img
    }

    /// Rebuilds the in-RAM tables from a parsed metadata image. Everything
    /// read back counts as committed.
    pub fn meta_img_apply(&mut self, img: &[u8]) -> Result<(), FtlErr>
    {
        for i in 0..self.avail_cnt as usize {
            let entry: AvailEntry = bincode_opt()
                .deserialize(&img[i * 8..(i + 1) * 8])
                .map_err(|_| FtlErr::InvalidMetadata)?;

            if !entry.is_free() && entry.blk_ix >= self.blk_cnt {
                return Err(FtlErr::InvalidMetadata);
            }

            self.avail_tbl[i] = entry;
            self.avail_meta_id[i] = ERASE_CNT_INVALID;
        }
        self.avail_commit_map.set_all();
        self.avail_meta_map.clear_all();

        self.bad_tbl.clear();
        for i in 0..self.max_bad as usize {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&img[self.off_bad + i * 4..self.off_bad + (i + 1) * 4]);
            let val = u32::from_le_bytes(raw);

            if val != BLK_IX_INVALID {
                if val >= self.blk_cnt {
                    return Err(FtlErr::InvalidMetadata);
                }
                self.bad_tbl.push(val);
            }
        }

        self.dirty_map = Bitmap::from_bytes(&img[self.off_dirty..], self.blk_cnt as usize);

        let esize = self.ub_entry_size();
        for u in 0..self.ub_cnt as usize {
            let off = self.off_ub + u * esize;
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&img[off..off + 4]);
            let blk_ix = u32::from_le_bytes(raw);

            if blk_ix != BLK_IX_INVALID && blk_ix >= self.blk_cnt {
                return Err(FtlErr::InvalidMetadata);
            }

            self.ub_tbl[u].blk_ix = blk_ix;
            self.ub_tbl[u].valid_map = Bitmap::from_bytes(&img[off + 4..], self.spb as usize);
        }

        if self.dirty_map_committed.is_some() {
            self.dirty_map_committed = Some(self.dirty_map.clone());
        }

        Ok(())
    }

    /// Programs the next sector of the active metadata block. A failed
    /// program abandons the block: the fold flag is raised and the commit
    /// in progress restarts on a fresh block.
    fn meta_sec_pgm(&mut self, data: &[u8], oos_buf: &[u8]) -> Result<(), FtlErr>
    {
        let sec = self.sec_phys_ix(self.meta_blk_ix, self.meta_next_sec_ix);

        match self.ctrlr.sec_wr(data, oos_buf, sec) {
            Ok(()) => {
                self.meta_next_sec_ix += 1;
                Ok(())
            }
            Err(CtrlrErr::Io) => {
                self.meta_fold_needed = true;
                Err(FtlErr::OpAborted)
            }
            Err(CtrlrErr::Timeout) => Err(FtlErr::DevTimeout),
        }
    }

    /// Commits the invalid part of the metadata image.
    ///
    /// `avail_only` restricts the commit to the available-table sector,
    /// tagged `AVAIL_BLK_TBL_ONLY` so remount can tell it from a full
    /// commit. A full commit writes the invalid sectors in ascending order
    /// tagged NEW / UNFINISHED... / FINISHED; only the FINISHED write makes
    /// the sequence effective.
    pub fn meta_commit(&mut self, avail_only: bool) -> Result<(), FtlErr>
    {
        if self.meta_blk_ix == BLK_IX_INVALID {
            return Err(FtlErr::InvalidLowFmt);
        }

        let mut avail_only = avail_only;

        loop {
            if self.meta_fold_needed {
                self.meta_fold()?;
                avail_only = false;
            }

            let list: Vec<u32> = if avail_only {
                if self.meta_invalid_map.get(0) { vec![0] } else { Vec::new() }
            } else {
                (0..self.meta_sec_cnt)
                    .filter(|s| self.meta_invalid_map.get(*s as usize))
                    .collect()
            };

            if list.is_empty() {
                return Ok(());
            }

            let free = self.spb - self.meta_next_sec_ix;
            if list.len() as u32 > free {
                self.meta_fold()?;
                avail_only = false;
                continue;
            }

            let img = self.meta_img_build();
            let cnt = list.len();
            let mut aborted = false;

            for (k, sec_ix) in list.iter().enumerate() {
                let status = if avail_only {
                    SeqStatus::AvailOnly
                } else if k == cnt - 1 {
                    SeqStatus::Finished
                } else if k == 0 {
                    SeqStatus::New
                } else {
                    SeqStatus::Unfinished
                };

                let erase_cnt = if self.meta_next_sec_ix == 0 {
                    self.meta_erase_cnt_next
                } else {
                    ERASE_CNT_INVALID
                };

                let img_oos = MetaOos::new(erase_cnt, *sec_ix, self.meta_blk_id, status);
                let mut oos_buf = vec![0xffu8; self.oos_size as usize];
                oos::meta_oos_wr(&mut oos_buf, &img_oos, self.ecc_strength)?;

                let off = *sec_ix as usize * self.sec_size as usize;
                let data = &img[off..off + self.sec_size as usize];

                match self.meta_sec_pgm(data, &oos_buf) {
                    Ok(()) => (),
                    Err(FtlErr::OpAborted) => {
                        aborted = true;
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }

            if aborted {
                continue;
            }

            if avail_only {
                self.meta_invalid_map.clear(0);
            } else {
                for sec_ix in list {
                    self.meta_invalid_map.clear(sec_ix as usize);
                }
                self.avail_commit_map.set_all();
                if self.dirty_map_committed.is_some() {
                    self.dirty_map_committed = Some(self.dirty_map.clone());
                }
            }

            return Ok(());
        }
    }

    /// Rewrites the complete metadata image into a newly allocated block
    /// under the next sequence ID. The reserved available-table slots exist
    /// for this path; the pool is refilled back to its pre-fold count right
    /// after the allocation.
    pub fn meta_fold(&mut self) -> Result<(), FtlErr>
    {
        let prefold_cnt = self.avail_used_cnt();

        self.meta_blk_id = self.meta_blk_id.wrapping_add(1);

        let (blk, erase_cnt) = match self.get_erased_blk(true) {
            Ok(v) => v,
            Err(e) => {
                self.meta_blk_id = self.meta_blk_id.wrapping_sub(1);
                return Err(e);
            }
        };

        let old = self.meta_blk_ix;
        self.meta_blk_ix = blk;
        self.meta_next_sec_ix = 0;
        self.meta_erase_cnt_next = erase_cnt;
        self.meta_fold_needed = false;
        self.meta_invalid_map.set_all();

        if old != BLK_IX_INVALID {
            self.dirty_bit_set(old);
        }

        self.logger.log(1, &format!(
            "metadata folded onto block {} (id {})", blk, self.meta_blk_id,
        ));

        self.avail_tbl_fill(prefold_cnt)?;

        Ok(())
    }

    /// Finds the current physical offset of a meta sector inside the active
    /// block by walking backward from the append point. Sectors above an
    /// unterminated NEW belong to a crashed commit and are stale.
    pub fn meta_sec_find(&mut self, target: u32) -> Result<Option<u32>, FtlErr>
    {
        let mut data = vec![0u8; self.sec_size as usize];
        let mut oos_buf = vec![0u8; self.oos_size as usize];
        let mut seq_valid = false;

        for off in (0..self.meta_next_sec_ix).rev() {
            let used =
                self.sec_rd_phy_no_refresh(self.meta_blk_ix, off, &mut data, &mut oos_buf)?;
            if !used {
                continue;
            }

            let img = match oos::meta_oos_rd(&oos_buf) {
                Ok(img) => img,
                Err(_) => continue,
            };
            if img.meta_blk_id != self.meta_blk_id {
                continue;
            }

            let status = match SeqStatus::from_raw(img.seq_status) {
                Some(s) => s,
                None => continue,
            };

            let valid = match status {
                SeqStatus::Finished | SeqStatus::AvailOnly => {
                    seq_valid = true;
                    true
                }
                SeqStatus::New => {
                    let was = seq_valid;
                    seq_valid = true;
                    was
                }
                SeqStatus::Unfinished => seq_valid,
            };

            if valid && img.meta_sec_ix == target {
                return Ok(Some(off));
            }
        }

        Ok(None)
    }

    /// First unwritten sector offset of a block, from the used marks.
    pub fn blk_next_sec_ix_find(&mut self, blk_ix: u32) -> Result<u32, FtlErr>
    {
        for off in (0..self.spb).rev() {
            if self.sec_is_used(blk_ix, off)? {
                return Ok(off + 1);
            }
        }

        Ok(0)
    }

    /// Boot-time scan for the active metadata block: every block's first
    /// sector is probed, and the highest sequence ID wins under the
    /// wrap-around rule. The losing side seeds the dirty-bitmap round-robin
    /// search position.
    pub fn meta_blk_find(&mut self) -> Result<(), FtlErr>
    {
        let mut data = vec![0u8; self.sec_size as usize];
        let mut oos_buf = vec![0u8; self.oos_size as usize];
        let mut found: Vec<(u32, u32)> = Vec::new();

        for blk in 0..self.blk_cnt {
            if blk == self.hdr_blk_ix {
                continue;
            }

            let used = match self.sec_rd_phy_no_refresh(blk, 0, &mut data, &mut oos_buf) {
                Ok(u) => u,
                Err(FtlErr::EccUncorr) => continue,
                Err(e) => return Err(e),
            };
            if !used || oos::sec_type_of(&oos_buf) != Some(SecType::Metadata) {
                continue;
            }

            if let Ok(img) = oos::meta_oos_rd(&oos_buf) {
                found.push((blk, img.meta_blk_id));
            }
        }

        if found.is_empty() {
            return Err(FtlErr::InvalidLowFmt);
        }

        let id_max = found.iter().map(|(_, id)| *id).max().unwrap();
        let id_min = found.iter().map(|(_, id)| *id).min().unwrap();

        let winner_id = if id_max - id_min > META_ID_HALF {
            // Wrapped: the true maximum is the largest ID in the low half.
            found.iter().map(|(_, id)| *id).filter(|id| *id <= META_ID_HALF).max().unwrap()
        } else {
            id_max
        };

        if found.iter().filter(|(_, id)| *id == winner_id).count() > 1 {
            // Two metadata blocks with one ID: the log is corrupted.
            self.logger.log(0, "duplicate metadata sequence ID");
            if self.cfg.clr_corrupt_metablk {
                for (blk, _) in &found {
                    let _ = self.ctrlr.blk_erase(*blk);
                }
            }
            return Err(FtlErr::CorruptLowFmt);
        }

        let winner_blk = found.iter().find(|(_, id)| *id == winner_id).unwrap().0;
        let loser_blk = found.iter().find(|(_, id)| *id == id_min).unwrap().0;

        self.meta_blk_ix = winner_blk;
        self.meta_blk_id = winner_id;
        self.dirty_srch_pos = loser_blk;

        Ok(())
    }

    /// Rebuilds the metadata image starting from the active block, walking
    /// backward and following the sequence IDs into predecessor blocks until
    /// every meta sector has been seen. The invalid map is left holding the
    /// sectors that are absent from the active block, so the next commit
    /// brings the block up to a complete image.
    pub fn meta_parse(&mut self) -> Result<(), FtlErr>
    {
        self.meta_next_sec_ix = self.blk_next_sec_ix_find(self.meta_blk_ix)?;

        let ss = self.sec_size as usize;
        let cnt = self.meta_sec_cnt as usize;
        let mut img = vec![0u8; cnt * ss];
        let mut found = Bitmap::new(cnt);
        let mut found_in_active = Bitmap::new(cnt);

        let mut data = vec![0u8; ss];
        let mut oos_buf = vec![0u8; self.oos_size as usize];

        // The active block answers through the regular sector search.
        for sec in 0..self.meta_sec_cnt {
            if let Some(off) = self.meta_sec_find(sec)? {
                let _ = self.sec_rd_phy_no_refresh(self.meta_blk_ix, off, &mut data, &mut oos_buf)?;
                let ix = sec as usize;
                img[ix * ss..(ix + 1) * ss].copy_from_slice(&data);
                found.set(ix);
                found_in_active.set(ix);
            }
        }

        // Sectors the active block lacks live in predecessor generations.
        let mut cur_id = self.meta_blk_id;
        let mut visited = 0u32;

        while found.count_set() < cnt {
            let prev_id = cur_id.wrapping_sub(1);
            let mut prev_blk = None;

            for blk in 0..self.blk_cnt {
                if blk == self.hdr_blk_ix || blk == self.meta_blk_ix {
                    continue;
                }
                let used = match self.sec_rd_phy_no_refresh(blk, 0, &mut data, &mut oos_buf) {
                    Ok(u) => u,
                    Err(FtlErr::EccUncorr) => continue,
                    Err(e) => return Err(e),
                };
                if !used {
                    continue;
                }
                if let Ok(m) = oos::meta_oos_rd(&oos_buf) {
                    if m.meta_blk_id == prev_id {
                        prev_blk = Some(blk);
                        break;
                    }
                }
            }

            let cur_blk = match prev_blk {
                Some(b) => b,
                None => return Err(FtlErr::InvalidMetadata),
            };
            let cur_next = self.blk_next_sec_ix_find(cur_blk)?;
            let mut seq_valid = false;

            for off in (0..cur_next).rev() {
                let used = match self.sec_rd_phy_no_refresh(cur_blk, off, &mut data, &mut oos_buf)
                {
                    Ok(u) => u,
                    // An unreadable sector may still have an older copy in
                    // an even earlier generation.
                    Err(FtlErr::EccUncorr) => continue,
                    Err(e) => return Err(e),
                };
                if !used {
                    continue;
                }

                let m = match oos::meta_oos_rd(&oos_buf) {
                    Ok(m) => m,
                    Err(_) => continue,
                };
                if m.meta_blk_id != prev_id {
                    continue;
                }

                let status = match SeqStatus::from_raw(m.seq_status) {
                    Some(s) => s,
                    None => continue,
                };

                let valid = match status {
                    SeqStatus::Finished => {
                        seq_valid = true;
                        true
                    }
                    SeqStatus::AvailOnly => {
                        // A committed one-off; terminates staleness but
                        // carries no image content beyond the replayed table.
                        seq_valid = true;
                        continue;
                    }
                    SeqStatus::New => {
                        let was = seq_valid;
                        seq_valid = true;
                        was
                    }
                    SeqStatus::Unfinished => seq_valid,
                };

                if !valid || m.meta_sec_ix >= self.meta_sec_cnt {
                    continue;
                }

                let ix = m.meta_sec_ix as usize;
                if !found.get(ix) {
                    img[ix * ss..(ix + 1) * ss].copy_from_slice(&data);
                    found.set(ix);
                }
            }

            cur_id = prev_id;
            visited += 1;
            if visited > self.blk_cnt {
                return Err(FtlErr::InvalidMetadata);
            }
        }

        self.meta_img_apply(&img)?;

        for sec in 0..cnt {
            self.meta_invalid_map.assign(sec, !found_in_active.get(sec));
        }

        Ok(())
    }

    /// Replays available-table commits newer than the last full commit:
    /// `AVAIL_BLK_TBL_ONLY` one-offs and the table sector of an unfinished
    /// sequence. Entries naming dirty blocks are reinserted; when the table
    /// is full, a dummy sector preserves the erase count inside the block
    /// itself.
    pub fn meta_avail_replay(&mut self) -> Result<(), FtlErr>
    {
        let mut data = vec![0u8; self.sec_size as usize];
        let mut oos_buf = vec![0u8; self.oos_size as usize];

        // Offset just above the last fully-committed sequence.
        let mut start = 0;
        for off in (0..self.meta_next_sec_ix).rev() {
            let used = match self.sec_rd_phy_no_refresh(self.meta_blk_ix, off, &mut data, &mut oos_buf)
            {
                Ok(u) => u,
                Err(FtlErr::EccUncorr) => continue,
                Err(e) => return Err(e),
            };
            if !used {
                continue;
            }
            if let Ok(m) = oos::meta_oos_rd(&oos_buf) {
                if m.meta_blk_id == self.meta_blk_id
                    && SeqStatus::from_raw(m.seq_status) == Some(SeqStatus::Finished)
                {
                    start = off + 1;
                    break;
                }
            }
        }

        for off in start..self.meta_next_sec_ix {
            let used = match self.sec_rd_phy_no_refresh(self.meta_blk_ix, off, &mut data, &mut oos_buf)
            {
                Ok(u) => u,
                Err(FtlErr::EccUncorr) => continue,
                Err(e) => return Err(e),
            };
            if !used {
                continue;
            }

            let m = match oos::meta_oos_rd(&oos_buf) {
                Ok(m) => m,
                Err(_) => continue,
            };
            if m.meta_blk_id != self.meta_blk_id || m.meta_sec_ix != 0 {
                continue;
            }

            for i in 0..self.avail_cnt as usize {
                let entry: AvailEntry = match bincode_opt().deserialize(&data[i * 8..(i + 1) * 8])
                {
                    Ok(e) => e,
                    Err(_) => continue,
                };

                if entry.is_free()
                    || entry.blk_ix >= self.blk_cnt
                    || self.blk_is_avail(entry.blk_ix)
                    || !self.blk_is_dirty(entry.blk_ix)
                {
                    continue;
                }

                if self.avail_tbl.iter().any(|e| e.is_free()) {
                    self.avail_blk_add(entry.blk_ix, Some(entry.erase_cnt))?;
                    self.dirty_bit_clr(entry.blk_ix);
                } else {
                    // No room: park the erase count in the block itself.
                    match self.ctrlr.blk_erase(entry.blk_ix) {
                        Ok(()) => (),
                        Err(CtrlrErr::Io) => {
                            self.blk_mark_bad(entry.blk_ix)?;
                            continue;
                        }
                        Err(CtrlrErr::Timeout) => return Err(FtlErr::DevTimeout),
                    }

                    let dummy = StorageOos::dummy(entry.erase_cnt.wrapping_add(1), BLK_IX_INVALID);
                    let mut dummy_oos = vec![0xffu8; self.oos_size as usize];
                    oos::storage_oos_wr(&mut dummy_oos, &dummy, self.ecc_strength)?;
                    let zero = vec![0u8; self.sec_size as usize];
                    let sec = self.sec_phys_ix(entry.blk_ix, 0);

                    match self.ctrlr.sec_wr(&zero, &dummy_oos, sec) {
                        Ok(()) => (),
                        Err(CtrlrErr::Io) => {
                            self.blk_mark_bad(entry.blk_ix)?;
                        }
                        Err(CtrlrErr::Timeout) => return Err(FtlErr::DevTimeout),
                    }
                }
            }
        }

        Ok(())
    }
}
