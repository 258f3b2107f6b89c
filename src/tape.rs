//! Tape control structures shared with the remote helper.
//!
//! The remote helper performs the actual `ioctl` calls; this module defines
//! the operation codes and the status structure as they travel over the
//! wire, plus the classification of which ioctl requests the protocol can
//! carry at all.

use std::io;
use std::mem;

use num_enum::IntoPrimitive;
use num_enum::TryFromPrimitive;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Tape operations accepted by the issue-tape-op request.
///
/// The numeric values follow the Linux `mtio.h` table and are transmitted
/// verbatim; the remote helper interprets them against its own kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
#[repr(i32)]
#[allow(non_camel_case_types)]
pub enum MtOp {
    /// Reset drive in case of problems.
    MTRESET = 0,
    /// Forward space over filemarks.
    MTFSF = 1,
    /// Backward space over filemarks.
    MTBSF = 2,
    /// Forward space records.
    MTFSR = 3,
    /// Backward space records.
    MTBSR = 4,
    /// Write filemarks.
    MTWEOF = 5,
    /// Rewind.
    MTREW = 6,
    /// Rewind and put the drive offline.
    MTOFFL = 7,
    /// No op: set status only.
    MTNOP = 8,
    /// Retension the tape.
    MTRETEN = 9,
    /// Backward space filemarks, position on the last mark.
    MTBSFM = 10,
    /// Forward space filemarks, position on the last mark.
    MTFSFM = 11,
    /// Go to the end of recorded media.
    MTEOM = 12,
    /// Erase the tape.
    MTERASE = 13,
    /// Set the block size.
    MTSETBLK = 20,
    /// Set the tape density.
    MTSETDENSITY = 21,
    /// Seek to a block.
    MTSEEK = 22,
    /// Tell the current block.
    MTTELL = 23,
    /// Space forward over setmarks.
    MTFSS = 25,
    /// Space backward over setmarks.
    MTBSS = 26,
    /// Write setmarks.
    MTWSM = 27,
    /// Lock the drive door.
    MTLOCK = 28,
    /// Unlock the drive door.
    MTUNLOCK = 29,
    /// Load the tape.
    MTLOAD = 30,
    /// Unload the tape.
    MTUNLOAD = 31,
}

/// Drive status as returned by the get-status request.
///
/// Plain-old-data by construction: the remote helper transmits its native
/// structure byte for byte and the layout below matches the historical
/// 64-bit arrangement.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable,
)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
#[repr(C)]
pub struct MtGet {
    /// Type of magnetic tape device.
    pub mt_type: i64,
    /// Residual count of the last operation.
    pub mt_resid: i64,
    /// Status register.
    pub mt_dsreg: i64,
    /// Generic (device independent) status.
    pub mt_gstat: i64,
    /// Error register.
    pub mt_erreg: i64,
    /// Number of the current file on the tape.
    pub mt_fileno: i32,
    /// Current block number.
    pub mt_blkno: i32,
}

/// The raw argument of an issue-tape-op ioctl, used only to size the
/// request constants below.
#[repr(C)]
#[allow(dead_code)]
struct RawMtOp {
    mt_op: libc::c_short,
    mt_count: libc::c_int,
}

/// Request number of the issue-tape-op ioctl.
pub const MTIOCTOP: libc::c_ulong =
    nix::request_code_write!('m', 1, mem::size_of::<RawMtOp>()) as libc::c_ulong;

/// Request number of the get-tape-status ioctl.
pub const MTIOCGET: libc::c_ulong =
    nix::request_code_read!('m', 2, mem::size_of::<MtGet>()) as libc::c_ulong;

/// The two ioctl requests the wire protocol can express.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapeIoctl {
    /// `MTIOCTOP`: issue a tape operation.
    Operation,
    /// `MTIOCGET`: retrieve drive status.
    GetStatus,
}

impl TapeIoctl {
    /// Classifies a raw ioctl request number. Anything the protocol cannot
    /// carry is refused here, before a single byte is sent.
    pub fn from_request(request: libc::c_ulong) -> io::Result<TapeIoctl> {
        match request {
            MTIOCTOP => Ok(TapeIoctl::Operation),
            MTIOCGET => Ok(TapeIoctl::GetStatus),
            _ => Err(io::Error::from_raw_os_error(libc::EOPNOTSUPP)),
        }
    }
}

/// Swaps every adjacent byte pair of the status structure in place.
///
/// Historical helpers on opposite-endian machines transmit their native
/// layout; the caller applies this if and only if `mt_type` comes out
/// larger than 255.
pub(crate) fn swap_status_bytes(status: &mut MtGet) {
    for pair in status.as_mut_bytes().chunks_exact_mut(2) {
        pair.swap(0, 1);
    }
}
