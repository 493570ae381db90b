use std::fs::OpenOptions;
use std::path::PathBuf;

use anyhow::bail;
use clap::{ArgEnum, Parser};

mod bitmap;
mod error;
mod fill;
mod ftl;
mod logger;
mod nand;
mod util;

use error::FtlErr;
use fill::FillMode;
use ftl::{FtlCfg, IoCtl, IoCtlOut, NandDev};
use logger::Logger;
use nand::file::FileCtrlr;
use nand::{DefectMark, PartData};

#[derive(Debug, Parser)]
struct Args {
    /// NAND image file
    #[clap(short, long, parse(from_os_str), value_name = "IMAGE")]
    image: PathBuf,

    /// Operation to perform
    #[clap(short, long, arg_enum, value_name = "OP")]
    op: Op,

    /// Page size in bytes
    #[clap(long, default_value = "2048")]
    page_size: u32,

    /// Pages per block
    #[clap(long, default_value = "64")]
    pgs_per_blk: u32,

    /// Block count
    #[clap(long, default_value = "256")]
    blk_cnt: u32,

    /// Raw spare bytes per page
    #[clap(long, default_value = "64")]
    spare_size: u32,

    /// Maximum factory bad-block count
    #[clap(long, default_value = "40")]
    max_bad: u32,

    /// First logical sector of the operation
    #[clap(short, long, default_value = "0")]
    sector: u64,

    /// Sector count of the operation
    #[clap(short, long, default_value = "1")]
    count: u64,

    /// Physical block index, for the physical debug operations
    #[clap(long, default_value = "0")]
    blk: u32,

    /// Byte written by the write operations
    #[clap(long, default_value = "0")]
    pattern: u8,

    /// Fill pattern generator
    #[clap(long, arg_enum, default_value = "chacha20")]
    fill_mode: FillMode,

    /// Seed for the fill generators
    #[clap(long, default_value = "0")]
    seed: u64,

    /// Set verbosity of the output (can be used multiple times)
    #[clap(short, long, parse(from_occurrences))]
    verbose: u32,

    /// Log file
    #[clap(short, long, parse(from_os_str), value_name = "FILE")]
    log_file: Option<PathBuf>,
}

/// Tool operations; each invocation performs exactly one. The phy variants
/// bypass the translation layer and address the raw medium.
#[derive(Copy, Clone, Debug, ArgEnum)]
enum Op {
    Format,
    Info,
    Dump,
    Fill,
    Read,
    Write,
    ChipErase,
    Refresh,
    RdSecPhy,
    WrSecPhy,
    EraseBlkPhy,
}

fn main()
{
    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> anyhow::Result<()>
{
    let part = PartData {
        page_size: args.page_size,
        pgs_per_blk: args.pgs_per_blk,
        blk_cnt: args.blk_cnt,
        programs_per_pg: 1,
        spare_size: args.spare_size,
        bus_width: 8,
        max_bad_blk_cnt: args.max_bad,
        defect_mark: DefectMark::SpareL1Pg1Or2,
        ecc_strength: 2,
    };

    let mut log_file = None;
    if let Some(path) = &args.log_file {
        log_file = Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?,
        );
    }

    let create = matches!(args.op, Op::Format);
    let ctrlr = FileCtrlr::open(&args.image, part, create)?;
    let logger = Logger::new(args.verbose, log_file);
    let mut dev = NandDev::open(ctrlr, FtlCfg::default(), logger)?;

    match args.op {
        Op::Format => {
            dev.io_ctl(IoCtl::LowFmt)?;
            dev.io_ctl(IoCtl::LowUnmount)?;
            println!("formatted: {} blocks", args.blk_cnt);
        }
        Op::Info => {
            dev.io_ctl(IoCtl::LowMount)?;
            let info = dev.query();
            println!(
                "sector size {} B, {} logical sectors ({} KiB)",
                info.sec_size,
                info.sec_cnt,
                info.sec_cnt * info.sec_size as u64 / 1024,
            );
        }
        Op::Dump => {
            dev.io_ctl(IoCtl::LowMount)?;
            if let IoCtlOut::Text(text) = dev.io_ctl(IoCtl::Dump)? {
                println!("{}", text);
            }
        }
        Op::Fill => {
            dev.io_ctl(IoCtl::LowMount)?;
            let cnt =
                fill::fill_sectors(&mut dev, args.fill_mode, args.sector, args.count, args.seed)?;
            dev.io_ctl(IoCtl::Sync)?;
            dev.io_ctl(IoCtl::LowUnmount)?;
            println!("filled {} sectors from {}", cnt, args.sector);
        }
        Op::Read => {
            dev.io_ctl(IoCtl::LowMount)?;
            let ss = dev.query().sec_size as usize;
            let mut buf = vec![0u8; ss];

            for i in 0..args.count {
                let sec = args.sector + i;
                // A never-written sector reads as zeroes at this level.
                match dev.rd(sec, 1, &mut buf) {
                    Ok(()) => (),
                    Err(FtlErr::NoSuchSec) => buf.fill(0),
                    Err(e) => return Err(e.into()),
                }
                print_sector(sec, &buf);
            }
        }
        Op::Write => {
            dev.io_ctl(IoCtl::LowMount)?;
            let ss = dev.query().sec_size as usize;
            let buf = vec![args.pattern; ss * args.count as usize];
            dev.wr(args.sector, args.count as u32, &buf)?;
            dev.io_ctl(IoCtl::Sync)?;
            dev.io_ctl(IoCtl::LowUnmount)?;
            println!("wrote {} sectors from {}", args.count, args.sector);
        }
        Op::ChipErase => {
            dev.io_ctl(IoCtl::ChipErase)?;
            println!("chip erased");
        }
        Op::Refresh => {
            dev.io_ctl(IoCtl::LowMount)?;
            dev.io_ctl(IoCtl::Refresh)?;
            dev.io_ctl(IoCtl::LowUnmount)?;
            println!("device refreshed");
        }
        Op::RdSecPhy => {
            if let IoCtlOut::Data(data) = dev.io_ctl(IoCtl::RdSecPhy { sec_ix_phy: args.sector })? {
                print_sector(args.sector, &data);
            }
        }
        Op::WrSecPhy => {
            let ss = dev.query().sec_size as usize;
            let data = vec![args.pattern; ss];
            dev.io_ctl(IoCtl::WrSecPhy { sec_ix_phy: args.sector, data })?;
            println!("programmed physical sector {}", args.sector);
        }
        Op::EraseBlkPhy => {
            if args.blk >= args.blk_cnt {
                bail!("block {} out of range", args.blk);
            }
            dev.io_ctl(IoCtl::EraseBlkPhy { blk_ix_phy: args.blk })?;
            println!("erased physical block {}", args.blk);
        }
    }

    Ok(())
}

fn print_sector(sec: u64, buf: &[u8])
{
    println!("sector {}:", sec);

    for (i, chunk) in buf.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
        println!("  {:06x}  {}", i * 16, hex.join(" "));
    }
}
