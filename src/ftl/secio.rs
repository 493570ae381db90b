use crate::error::FtlErr;
use crate::nand::{Ctrlr, CtrlrErr, EccStatus};
use super::{NandDev, BLK_IX_INVALID, ERASE_CNT_INVALID};
use super::oos::{self, OOS_USED_MARK_OFF};

impl<C: Ctrlr> NandDev<C> {
    pub fn sec_phys_ix(&self, blk_ix: u32, sec_offset: u32) -> u64
    {
        blk_ix as u64 * self.spb as u64 + sec_offset as u64
    }

    pub fn blk_is_bad(&self, blk_ix: u32) -> bool
    {
        self.bad_tbl.contains(&blk_ix)
    }

    /// Internal logical alias of an update-block slot, used by the sector
    /// I/O helpers' address computation.
    pub fn lb_alias_ub(&self, ub_ix: usize) -> u32
    {
        self.n_data + ub_ix as u32
    }

    /// Internal logical alias of the active metadata block.
    pub fn lb_alias_meta(&self) -> u32
    {
        self.n_data + self.ub_cnt
    }

    /// Maps a logical block index (data range or internal alias range) to
    /// its backing physical block.
    pub fn blk_ix_phy_get(&self, lb_ix: u32) -> u32
    {
        if lb_ix < self.n_data {
            self.l2p[lb_ix as usize]
        } else if lb_ix < self.n_data + self.ub_cnt {
            self.ub_tbl[(lb_ix - self.n_data) as usize].blk_ix
        } else if lb_ix == self.lb_alias_meta() {
            self.meta_blk_ix
        } else {
            BLK_IX_INVALID
        }
    }

    /// Probes the used mark without ECC; works on unreadable sectors.
    pub fn sec_is_used(&mut self, blk_ix: u32, sec_offset: u32) -> Result<bool, FtlErr>
    {
        let mut mark = vec![0u8; 2 * self.ecc_strength as usize];
        let sec = self.sec_phys_ix(blk_ix, sec_offset);

        self.ctrlr.oos_rd_raw(&mut mark, sec, OOS_USED_MARK_OFF)?;

        Ok(oos::used_mark_is_set(&mark))
    }

    /// Physical read that never mutates the device: retries uncorrectable
    /// reads, then consults the used mark. Returns whether the sector is
    /// used; an unused sector "reads" successfully as absent, so mount and
    /// parse can walk half-written blocks.
    pub fn sec_rd_phy_no_refresh(
        &mut self,
        blk_ix: u32,
        sec_offset: u32,
        data: &mut [u8],
        oos_buf: &mut [u8],
    ) -> Result<bool, FtlErr>
    {
        let sec = self.sec_phys_ix(blk_ix, sec_offset);

        for _ in 0..self.max_rd_retries {
            match self.ctrlr.sec_rd(data, oos_buf, sec)? {
                EccStatus::Ok | EccStatus::Corr | EccStatus::CriticalCorr => {
                    let off = OOS_USED_MARK_OFF as usize;
                    let len = 2 * self.ecc_strength as usize;
                    return Ok(oos::used_mark_is_set(&oos_buf[off..off + len]));
                }
                EccStatus::Uncorr => (),
            }
        }

        if self.sec_is_used(blk_ix, sec_offset)? {
            Err(FtlErr::EccUncorr)
        } else {
            Ok(false)
        }
    }

    /// Read handler for mounted operation. Uncorrectable or critically
    /// corrected ECC triggers a refresh of the whole block; if the refresh
    /// itself fails the block is marked bad. The original outcome is still
    /// reported: critical corrections carry valid data, uncorrectable reads
    /// do not.
    pub fn sec_rd_handler(
        &mut self,
        lb_ix: u32,
        sec_offset: u32,
        data: &mut [u8],
        oos_buf: &mut [u8],
    ) -> Result<(), FtlErr>
    {
        let blk_ix = self.blk_ix_phy_get(lb_ix);
        if blk_ix == BLK_IX_INVALID {
            return Err(FtlErr::NoSuchSec);
        }

        let sec = self.sec_phys_ix(blk_ix, sec_offset);

        match self.ctrlr.sec_rd(data, oos_buf, sec)? {
            EccStatus::Ok | EccStatus::Corr => Ok(()),
            EccStatus::CriticalCorr => {
                self.logger.log(1, &format!("ecc stress in block {}, refreshing", blk_ix));
                if self.blk_refresh(blk_ix).is_err() {
                    self.blk_mark_bad(blk_ix)?;
                }
                Ok(())
            }
            EccStatus::Uncorr => {
                if self.blk_refresh(blk_ix).is_err() {
                    self.blk_mark_bad(blk_ix)?;
                }
                Err(FtlErr::EccUncorr)
            }
        }
    }

    /// Write handler for storage sectors. A failed program means the block
    /// died: its readable content is moved away, the block is marked bad and
    /// the caller retries against the replacement target.
    pub fn sec_wr_handler(
        &mut self,
        lb_ix: u32,
        sec_offset: u32,
        data: &[u8],
        oos_buf: &[u8],
    ) -> Result<(), FtlErr>
    {
        let blk_ix = self.blk_ix_phy_get(lb_ix);
        if blk_ix == BLK_IX_INVALID {
            return Err(FtlErr::InvalidMetadata);
        }

        let sec = self.sec_phys_ix(blk_ix, sec_offset);

        match self.ctrlr.sec_wr(data, oos_buf, sec) {
            Ok(()) => Ok(()),
            Err(CtrlrErr::Io) => {
                let _ = self.blk_refresh(blk_ix);
                self.blk_mark_bad(blk_ix)?;
                Err(FtlErr::OpAborted)
            }
            Err(CtrlrErr::Timeout) => Err(FtlErr::DevTimeout),
        }
    }

    /// Copies a block's used sectors onto a fresh block and repoints
    /// whichever table references the old one. Sources that stay unreadable
    /// after the retry budget are copied as-read; for used sectors that is a
    /// recorded data-loss event, not a failure of the refresh.
    pub fn blk_refresh(&mut self, blk_ix: u32) -> Result<(), FtlErr>
    {
        'alloc: loop {
            let (dst, dst_cnt) = self.get_erased_blk(false)?;

            for off in 0..self.spb {
                if !self.sec_is_used(blk_ix, off)? {
                    continue;
                }

                let mut data = vec![0u8; self.sec_size as usize];
                let mut oos_buf = vec![0u8; self.oos_size as usize];
                let src = self.sec_phys_ix(blk_ix, off);
                let mut readable = false;

                for _ in 0..self.max_rd_retries {
                    match self.ctrlr.sec_rd(&mut data, &mut oos_buf, src)? {
                        EccStatus::Ok | EccStatus::Corr | EccStatus::CriticalCorr => {
                            readable = true;
                            break;
                        }
                        EccStatus::Uncorr => (),
                    }
                }

                if !readable {
                    self.logger.log(0, &format!(
                        "refresh: data loss in block {} sector {}", blk_ix, off,
                    ));
                }

                let cnt = if off == 0 { dst_cnt } else { ERASE_CNT_INVALID };
                oos::erase_cnt_set(&mut oos_buf, cnt);
                oos::used_mark_wr(&mut oos_buf, self.ecc_strength);

                let dst_sec = self.sec_phys_ix(dst, off);
                match self.ctrlr.sec_wr(&data, &oos_buf, dst_sec) {
                    Ok(()) => (),
                    Err(CtrlrErr::Io) => {
                        self.blk_mark_bad(dst)?;
                        continue 'alloc;
                    }
                    Err(CtrlrErr::Timeout) => return Err(FtlErr::DevTimeout),
                }
            }

            // Repoint whichever table owns the old block.
            if let Some(lb) = self.l2p.iter().position(|b| *b == blk_ix) {
                self.l2p[lb] = dst;
            } else if let Some(u) = self.ub_tbl.iter().position(|e| e.blk_ix == blk_ix) {
                self.ub_tbl[u].blk_ix = dst;
                self.meta_invalidate_ub_entry(u);
            } else if self.meta_blk_ix == blk_ix {
                self.meta_blk_ix = dst;
            } else {
                return Err(FtlErr::InvalidMetadata);
            }

            self.dirty_bit_set(blk_ix);
            self.logger.log(1, &format!("block {} refreshed onto {}", blk_ix, dst));

            return Ok(());
        }
    }

    /// Appends to the bad-block table and unmaps the block from every other
    /// table.
    pub fn blk_mark_bad(&mut self, blk_ix: u32) -> Result<(), FtlErr>
    {
        if self.bad_tbl.len() >= self.max_bad as usize {
            self.logger.log(0, "bad-block table full");
            return Err(FtlErr::CorruptLowFmt);
        }

        self.bad_tbl.push(blk_ix);
        let ix = self.bad_tbl.len() - 1;
        let off_bad = self.off_bad;
        self.meta_invalidate(off_bad + ix * 4, 4);

        if let Some(lb) = self.l2p.iter().position(|b| *b == blk_ix) {
            self.l2p[lb] = BLK_IX_INVALID;
        }
        if let Some(u) = self.ub_tbl.iter().position(|e| e.blk_ix == blk_ix) {
            self.ub_clr(u);
        }
        let _ = self.avail_blk_remove(blk_ix);
        if self.dirty_map.get(blk_ix as usize) {
            self.dirty_bit_clr(blk_ix);
        }

        self.logger.log(0, &format!("block {} marked bad", blk_ix));

        Ok(())
    }
}
