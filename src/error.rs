use thiserror::Error;

/// Errors surfaced to the sector client.
///
/// Corrected ECC never appears here; it is recovered locally. `OpAborted`
/// means the target block died under a program and the caller should retry
/// the same logical operation, which will land on a different physical
/// block.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum FtlErr {
    #[error("device is not low-level formatted")]
    InvalidLowFmt,
    #[error("low-level format is corrupted")]
    CorruptLowFmt,
    #[error("on-device low-level parameters do not match the configuration")]
    IncompatibleLowParams,
    #[error("invalid low-level parameters")]
    InvalidLowParams,
    #[error("invalid configuration")]
    InvalidCfg,
    #[error("invalid device metadata")]
    InvalidMetadata,
    #[error("device I/O error")]
    DevIo,
    #[error("device timeout")]
    DevTimeout,
    #[error("uncorrectable ECC error")]
    EccUncorr,
    #[error("no available blocks")]
    NoAvailBlk,
    #[error("sector has never been written")]
    NoSuchSec,
    #[error("operation aborted")]
    OpAborted,
    #[error("invalid I/O control operation")]
    InvalidIoCtl,
    #[error("device is full")]
    DevFull,
}
