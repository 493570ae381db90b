use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write, Error, ErrorKind};
use std::path::Path;

use super::{Ctrlr, CtrlrErr, EccStatus, PartData};

const ECC_BYTES: u32 = 4;

/// NAND controller backed by a flat image file.
///
/// The image stores each page's data followed by its raw spare area, in
/// physical page order. Program semantics match the RAM controller: bits can
/// only be cleared, and a CRC-32 kept in the reserved spare tail stands in
/// for ECC.
#[derive(Debug)]
pub struct FileCtrlr {
    file: File,
    part: PartData,
    sec_size: u32,
    secs_per_pg: u32,
    spare_per_sec: u32,
    oos_size: u32,
}

impl FileCtrlr {
    /// Opens (or, with `create`, creates and 0xFF-fills) an image file
    /// matching the partition geometry.
    pub fn open(path: &Path, part: PartData, create: bool) -> Result<Self, Error>
    {
        let img_size = part.blk_cnt as u64
            * part.pgs_per_blk as u64
            * (part.page_size + part.spare_size) as u64;

        let mut file = OpenOptions::new()
            .create(create)
            .read(true)
            .write(true)
            .open(path)?;

        let cur_size = file.seek(SeekFrom::End(0))?;

        if cur_size == 0 && create {
            // Fresh image: everything reads as erased.
            let blank = vec![0xffu8; (part.page_size + part.spare_size) as usize];
            file.seek(SeekFrom::Start(0))?;
            for _ in 0..part.blk_cnt as u64 * part.pgs_per_blk as u64 {
                file.write_all(&blank)?;
            }
        } else if cur_size != img_size {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("image size {} does not match geometry ({})", cur_size, img_size),
            ));
        }

        Ok(Self {
            file,
            part,
            sec_size: 0,
            secs_per_pg: 0,
            spare_per_sec: 0,
            oos_size: 0,
        })
    }

    fn pg_off(&self, pg_ix: u64) -> u64
    {
        pg_ix * (self.part.page_size + self.part.spare_size) as u64
    }

    fn sec_data_off(&self, sec_ix: u64) -> u64
    {
        let pg = sec_ix / self.secs_per_pg as u64;
        let sub = sec_ix % self.secs_per_pg as u64;

        self.pg_off(pg) + sub * self.sec_size as u64
    }

    fn sec_spare_off(&self, sec_ix: u64) -> u64
    {
        let pg = sec_ix / self.secs_per_pg as u64;
        let sub = sec_ix % self.secs_per_pg as u64;

        self.pg_off(pg) + self.part.page_size as u64 + sub * self.spare_per_sec as u64
    }

    fn rd_at(&mut self, off: u64, buf: &mut [u8]) -> Result<(), CtrlrErr>
    {
        self.file.seek(SeekFrom::Start(off)).map_err(|_| CtrlrErr::Io)?;
        self.file.read_exact(buf).map_err(|_| CtrlrErr::Io)
    }

    fn wr_at(&mut self, off: u64, buf: &[u8]) -> Result<(), CtrlrErr>
    {
        self.file.seek(SeekFrom::Start(off)).map_err(|_| CtrlrErr::Io)?;
        self.file.write_all(buf).map_err(|_| CtrlrErr::Io)
    }

    fn crc_of(data: &[u8], oos: &[u8]) -> u32
    {
        let val = crc::crc32::update(0, &crc::crc32::IEEE_TABLE, data);

        crc::crc32::update(val, &crc::crc32::IEEE_TABLE, oos)
    }
}

impl Ctrlr for FileCtrlr {
    fn setup(&mut self, sec_size: u32) -> Result<u32, CtrlrErr>
    {
        if sec_size == 0 || self.part.page_size % sec_size != 0 {
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
        let mut sec = vec![0u8; self.sec_size as usize];
        let mut spare = vec![0u8; self.spare_per_sec as usize];

        self.rd_at(self.sec_data_off(sec_ix_phy), &mut sec)?;
        self.rd_at(self.sec_spare_off(sec_ix_phy), &mut spare)?;

        let dlen = data.len().min(sec.len());
        let olen = oos.len().min(self.oos_size as usize);
        data[..dlen].copy_from_slice(&sec[..dlen]);
        oos[..olen].copy_from_slice(&spare[..olen]);

        let crc_off = self.oos_size as usize;
        let mut crc_bytes = [0u8; 4];
        crc_bytes.copy_from_slice(&spare[crc_off..crc_off + 4]);

        let stored = Self::crc_of(&sec, &spare[..self.oos_size as usize]);

        if stored == u32::from_le_bytes(crc_bytes) {
            Ok(EccStatus::Ok)
        } else {
            Ok(EccStatus::Uncorr)
        }
    }

    fn sec_wr(&mut self, data: &[u8], oos: &[u8], sec_ix_phy: u64)
        -> Result<(), CtrlrErr>
    {
        let mut wr_data = vec![0xffu8; self.sec_size as usize];
        let mut wr_oos = vec![0xffu8; self.oos_size as usize];
        let dlen = data.len().min(wr_data.len());
        let olen = oos.len().min(wr_oos.len());
        wr_data[..dlen].copy_from_slice(&data[..dlen]);
        wr_oos[..olen].copy_from_slice(&oos[..olen]);

        let crc = Self::crc_of(&wr_data, &wr_oos).to_le_bytes();

        // Read-modify-write: programming only clears bits.
        let mut sec = vec![0u8; self.sec_size as usize];
        let mut spare = vec![0u8; self.spare_per_sec as usize];
        self.rd_at(self.sec_data_off(sec_ix_phy), &mut sec)?;
        self.rd_at(self.sec_spare_off(sec_ix_phy), &mut spare)?;

        for (i, b) in wr_data.iter().enumerate() {
            sec[i] &= *b;
        }
        for (i, b) in wr_oos.iter().enumerate() {
            spare[i] &= *b;
        }
        for (i, b) in crc.iter().enumerate() {
            spare[self.oos_size as usize + i] &= *b;
        }

        self.wr_at(self.sec_data_off(sec_ix_phy), &sec)?;
        self.wr_at(self.sec_spare_off(sec_ix_phy), &spare)?;

        Ok(())
    }

    fn blk_erase(&mut self, blk_ix_phy: u32) -> Result<(), CtrlrErr>
    {
        let blank = vec![0xffu8; (self.part.page_size + self.part.spare_size) as usize];
        let pg_first = blk_ix_phy as u64 * self.part.pgs_per_blk as u64;

        for pg in pg_first..pg_first + self.part.pgs_per_blk as u64 {
            self.wr_at(self.pg_off(pg), &blank)?;
        }

        Ok(())
    }

    fn oos_rd_raw(&mut self, buf: &mut [u8], sec_ix_phy: u64, offset: u32)
        -> Result<(), CtrlrErr>
    {
        if offset as usize + buf.len() > self.spare_per_sec as usize {
            return Err(CtrlrErr::Io);
        }

        let off = self.sec_spare_off(sec_ix_phy) + offset as u64;
        self.rd_at(off, buf)
    }

    fn spare_rd_raw(&mut self, buf: &mut [u8], pg_ix_phy: u64, offset: u32)
        -> Result<(), CtrlrErr>
    {
        if offset as usize + buf.len() > self.part.spare_size as usize {
            return Err(CtrlrErr::Io);
        }

        let off = self.pg_off(pg_ix_phy) + self.part.page_size as u64 + offset as u64;
        self.rd_at(off, buf)
    }
}
