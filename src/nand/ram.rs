use super::{Ctrlr, CtrlrErr, EccStatus, PartData};

/// Number of spare bytes per sector the controller keeps for its ECC. The
/// emulation stores a CRC-32 of (data ‖ usable OOS) there; a mismatch on
/// read reports `Uncorr`, which is also what an erased sector yields.
const ECC_BYTES: u32 = 4;

/// RAM-backed NAND controller.
///
/// Faithful to NAND program semantics: programming can only clear bits, so
/// reprogramming a written sector without an erase corrupts its checksum and
/// surfaces as an uncorrectable read, like on real media.
///
/// Carries a small fault plan for the test suite: one-shot program/erase
/// failures and forced ECC statuses. `snapshot()` clones the media alone,
/// which is how power loss is simulated (remount the snapshot).
#[derive(Debug)]
pub struct RamCtrlr {
    part: PartData,
    data: Vec<u8>,
    spare: Vec<u8>,
    sec_size: u32,
    secs_per_pg: u32,
    spare_per_sec: u32,
    oos_size: u32,
    // Fault plan.
    pgm_fail_sec_type: Option<u8>,
    pgm_fail_at: Vec<u64>,
    erase_fail_at: Vec<u32>,
    ecc_force: Vec<(u64, EccStatus)>,
    pub pgm_cnt: u64,
    pub erase_cnt: u64,
}

impl RamCtrlr {
    pub fn new(part: PartData) -> Self
    {
        let pgs = part.blk_cnt as usize * part.pgs_per_blk as usize;

        Self {
            part,
            data: vec![0xff; pgs * part.page_size as usize],
            spare: vec![0xff; pgs * part.spare_size as usize],
            sec_size: 0,
            secs_per_pg: 0,
            spare_per_sec: 0,
            oos_size: 0,
            pgm_fail_sec_type: None,
            pgm_fail_at: Vec::new(),
            erase_fail_at: Vec::new(),
            ecc_force: Vec::new(),
            pgm_cnt: 0,
            erase_cnt: 0,
        }
    }

    /// Clones the media into a fresh controller with an empty fault plan;
    /// mounting the snapshot models power loss at this instant.
    pub fn snapshot(&self) -> Self
    {
        Self {
            part: self.part,
            data: self.data.clone(),
            spare: self.spare.clone(),
            sec_size: 0,
            secs_per_pg: 0,
            spare_per_sec: 0,
            oos_size: 0,
            pgm_fail_sec_type: None,
            pgm_fail_at: Vec::new(),
            erase_fail_at: Vec::new(),
            ecc_force: Vec::new(),
            pgm_cnt: 0,
            erase_cnt: 0,
        }
    }

    /// Arms a one-shot program failure for the next sector whose OOS carries
    /// the given sector-type byte.
    pub fn fail_next_pgm_of_type(&mut self, sec_type: u8)
    {
        self.pgm_fail_sec_type = Some(sec_type);
    }

    pub fn fail_pgm_at(&mut self, sec_ix_phy: u64)
    {
        self.pgm_fail_at.push(sec_ix_phy);
    }

    pub fn fail_erase_at(&mut self, blk_ix_phy: u32)
    {
        self.erase_fail_at.push(blk_ix_phy);
    }

    /// Forces the next read of the sector to report the given ECC status.
    pub fn force_ecc(&mut self, sec_ix_phy: u64, status: EccStatus)
    {
        self.ecc_force.push((sec_ix_phy, status));
    }

    /// Plants a factory defect marker: zeroes the first spare byte of every
    /// page of the block. Recognized by all the marking conventions.
    pub fn plant_factory_defect(&mut self, blk_ix: u32)
    {
        let spare_size = self.part.spare_size as usize;
        let pg_first = blk_ix as usize * self.part.pgs_per_blk as usize;

        for pg in pg_first..pg_first + self.part.pgs_per_blk as usize {
            let off = pg * spare_size;
            self.spare[off] = 0x00;
            self.spare[off + spare_size - 1] = 0x00;
        }
    }

    fn sec_data_off(&self, sec_ix: u64) -> usize
    {
        let pg = sec_ix / self.secs_per_pg as u64;
        let sub = sec_ix % self.secs_per_pg as u64;

        (pg * self.part.page_size as u64 + sub * self.sec_size as u64) as usize
    }

    fn sec_spare_off(&self, sec_ix: u64) -> usize
    {
        let pg = sec_ix / self.secs_per_pg as u64;
        let sub = sec_ix % self.secs_per_pg as u64;

        (pg * self.part.spare_size as u64 + sub * self.spare_per_sec as u64) as usize
    }

    fn crc_of(data: &[u8], oos: &[u8]) -> u32
    {
        let val = crc::crc32::update(0, &crc::crc32::IEEE_TABLE, data);

        crc::crc32::update(val, &crc::crc32::IEEE_TABLE, oos)
    }
}

impl Ctrlr for RamCtrlr {
    fn setup(&mut self, sec_size: u32) -> Result<u32, CtrlrErr>
    {
        if sec_size == 0
            || self.part.page_size % sec_size != 0
        {
            return Err(CtrlrErr::Io);
        }

        self.sec_size = sec_size;
        self.secs_per_pg = self.part.page_size / sec_size;
        self.spare_per_sec = self.part.spare_size / self.secs_per_pg;

        if self.spare_per_sec <= ECC_BYTES {
            return Err(CtrlrErr::Io);
        }

        self.oos_size = self.spare_per_sec - ECC_BYTES;

        Ok(self.oos_size)
    }

    fn part_data(&self) -> PartData
    {
        self.part
    }

    fn sec_rd(&mut self, data: &mut [u8], oos: &mut [u8], sec_ix_phy: u64)
        -> Result<EccStatus, CtrlrErr>
    {
        let doff = self.sec_data_off(sec_ix_phy);
        let soff = self.sec_spare_off(sec_ix_phy);
        let dlen = data.len().min(self.sec_size as usize);
        let olen = oos.len().min(self.oos_size as usize);

        data[..dlen].copy_from_slice(&self.data[doff..doff + dlen]);
        oos[..olen].copy_from_slice(&self.spare[soff..soff + olen]);

        if let Some(pos) = self.ecc_force.iter().position(|(s, _)| *s == sec_ix_phy) {
            let (_, status) = self.ecc_force.remove(pos);
            return Ok(status);
        }

        let stored_data = &self.data[doff..doff + self.sec_size as usize];
        let stored_oos = &self.spare[soff..soff + self.oos_size as usize];
        let crc_off = soff + self.oos_size as usize;
        let mut crc_bytes = [0u8; 4];
        crc_bytes.copy_from_slice(&self.spare[crc_off..crc_off + 4]);

        if Self::crc_of(stored_data, stored_oos) == u32::from_le_bytes(crc_bytes) {
            Ok(EccStatus::Ok)
        } else {
            Ok(EccStatus::Uncorr)
        }
    }

    fn sec_wr(&mut self, data: &[u8], oos: &[u8], sec_ix_phy: u64)
        -> Result<(), CtrlrErr>
    {
        self.pgm_cnt += 1;

        if let Some(ty) = self.pgm_fail_sec_type {
            if !oos.is_empty() && oos[0] == ty {
                self.pgm_fail_sec_type = None;
                return Err(CtrlrErr::Io);
            }
        }
        if let Some(pos) = self.pgm_fail_at.iter().position(|s| *s == sec_ix_phy) {
            self.pgm_fail_at.remove(pos);
            return Err(CtrlrErr::Io);
        }

        // Full write images: missing tails program as erased (0xFF).
        let mut wr_data = vec![0xffu8; self.sec_size as usize];
        let mut wr_oos = vec![0xffu8; self.oos_size as usize];
        let dlen = data.len().min(wr_data.len());
        let olen = oos.len().min(wr_oos.len());
        wr_data[..dlen].copy_from_slice(&data[..dlen]);
        wr_oos[..olen].copy_from_slice(&oos[..olen]);

        let crc = Self::crc_of(&wr_data, &wr_oos).to_le_bytes();

        // Programming can only clear bits.
        let doff = self.sec_data_off(sec_ix_phy);
        for (i, b) in wr_data.iter().enumerate() {
            self.data[doff + i] &= *b;
        }

        let soff = self.sec_spare_off(sec_ix_phy);
        for (i, b) in wr_oos.iter().enumerate() {
            self.spare[soff + i] &= *b;
        }

        let crc_off = soff + self.oos_size as usize;
        for (i, b) in crc.iter().enumerate() {
            self.spare[crc_off + i] &= *b;
        }

        Ok(())
    }

    fn blk_erase(&mut self, blk_ix_phy: u32) -> Result<(), CtrlrErr>
    {
        self.erase_cnt += 1;

        if let Some(pos) = self.erase_fail_at.iter().position(|b| *b == blk_ix_phy) {
            self.erase_fail_at.remove(pos);
            return Err(CtrlrErr::Io);
        }

        let pgs = self.part.pgs_per_blk as usize;
        let pg_first = blk_ix_phy as usize * pgs;
        let doff = pg_first * self.part.page_size as usize;
        let dlen = pgs * self.part.page_size as usize;
        let soff = pg_first * self.part.spare_size as usize;
        let slen = pgs * self.part.spare_size as usize;

        for b in self.data[doff..doff + dlen].iter_mut() {
            *b = 0xff;
        }
        for b in self.spare[soff..soff + slen].iter_mut() {
            *b = 0xff;
        }

        Ok(())
    }

    fn oos_rd_raw(&mut self, buf: &mut [u8], sec_ix_phy: u64, offset: u32)
        -> Result<(), CtrlrErr>
    {
        let soff = self.sec_spare_off(sec_ix_phy) + offset as usize;

        if offset as usize + buf.len() > self.spare_per_sec as usize {
            return Err(CtrlrErr::Io);
        }

        buf.copy_from_slice(&self.spare[soff..soff + buf.len()]);

        Ok(())
    }

    fn spare_rd_raw(&mut self, buf: &mut [u8], pg_ix_phy: u64, offset: u32)
        -> Result<(), CtrlrErr>
    {
        let off = pg_ix_phy as usize * self.part.spare_size as usize + offset as usize;

        if offset as usize + buf.len() > self.part.spare_size as usize {
            return Err(CtrlrErr::Io);
        }

        buf.copy_from_slice(&self.spare[off..off + buf.len()]);

        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::nand::DefectMark;

    fn part() -> PartData
    {
        PartData {
            page_size: 512,
            pgs_per_blk: 8,
            blk_cnt: 16,
            programs_per_pg: 1,
            spare_size: 16,
            bus_width: 8,
            max_bad_blk_cnt: 4,
            defect_mark: DefectMark::SpareL1Pg1Or2,
            ecc_strength: 1,
        }
    }

    #[test]
    fn rd_wr_roundtrip()
    {
        let mut c = RamCtrlr::new(part());
        let oos_size = c.setup(512).unwrap() as usize;

        let data = vec![0xa5u8; 512];
        let oos = vec![0x11u8; oos_size];
        c.sec_wr(&data, &oos, 9).unwrap();

        let mut rdata = vec![0u8; 512];
        let mut roos = vec![0u8; oos_size];
        let status = c.sec_rd(&mut rdata, &mut roos, 9).unwrap();

        assert_eq!(status, EccStatus::Ok);
        assert_eq!(rdata, data);
        assert_eq!(roos, oos);
    }

    #[test]
    fn erased_sector_is_uncorrectable()
    {
        let mut c = RamCtrlr::new(part());
        let oos_size = c.setup(512).unwrap() as usize;

        let mut data = vec![0u8; 512];
        let mut oos = vec![0u8; oos_size];
        let status = c.sec_rd(&mut data, &mut oos, 0).unwrap();

        assert_eq!(status, EccStatus::Uncorr);
        assert!(data.iter().all(|b| *b == 0xff));
    }

    #[test]
    fn reprogram_without_erase_corrupts()
    {
        let mut c = RamCtrlr::new(part());
        let oos_size = c.setup(512).unwrap() as usize;

        c.sec_wr(&vec![0x0fu8; 512], &vec![0xffu8; oos_size], 3).unwrap();
        c.sec_wr(&vec![0xf0u8; 512], &vec![0xffu8; oos_size], 3).unwrap();

        let mut data = vec![0u8; 512];
        let mut oos = vec![0u8; oos_size];
        assert_eq!(c.sec_rd(&mut data, &mut oos, 3).unwrap(), EccStatus::Uncorr);
    }

    #[test]
    fn erase_restores()
    {
        let mut c = RamCtrlr::new(part());
        let oos_size = c.setup(512).unwrap() as usize;

        c.sec_wr(&vec![0x00u8; 512], &vec![0x00u8; oos_size], 8).unwrap();
        c.blk_erase(1).unwrap();

        let mut data = vec![0u8; 512];
        let mut oos = vec![0u8; oos_size];
        assert_eq!(c.sec_rd(&mut data, &mut oos, 8).unwrap(), EccStatus::Uncorr);
        assert!(data.iter().all(|b| *b == 0xff));
        assert!(oos.iter().all(|b| *b == 0xff));
    }

    #[test]
    fn fault_plan()
    {
        let mut c = RamCtrlr::new(part());
        let oos_size = c.setup(512).unwrap() as usize;

        c.fail_pgm_at(5);
        assert_eq!(
            c.sec_wr(&vec![0u8; 512], &vec![0u8; oos_size], 5),
            Err(CtrlrErr::Io),
        );
        // One-shot: the retry goes through.
        c.sec_wr(&vec![0u8; 512], &vec![0u8; oos_size], 5).unwrap();

        c.force_ecc(5, EccStatus::CriticalCorr);
        let mut data = vec![0u8; 512];
        let mut oos = vec![0u8; oos_size];
        assert_eq!(c.sec_rd(&mut data, &mut oos, 5).unwrap(), EccStatus::CriticalCorr);
        assert_eq!(c.sec_rd(&mut data, &mut oos, 5).unwrap(), EccStatus::Ok);
    }

    #[test]
    fn factory_defect_detected()
    {
        let mut c = RamCtrlr::new(part());
        c.setup(512).unwrap();
        c.plant_factory_defect(7);

        assert!(crate::nand::blk_is_factory_defect(&mut c, 7, 512, 1).unwrap());
        assert!(!crate::nand::blk_is_factory_defect(&mut c, 6, 512, 1).unwrap());
    }
}
