//! Client for the remote magnetic tape (rmt) protocol.
//!
//! Archive programs historically drive a tape drive on another machine by
//! forking a remote shell that runs an `rmt` helper there, then speaking a
//! small line-oriented command protocol over the child's standard streams.
//! This crate implements the client side: it parses `[user@]host:file`
//! archive names, establishes the helper connection, and exposes the
//! familiar open/read/write/seek/close/ioctl surface over it, multiplexing
//! a handful of sessions behind small integer handles.
//!
//! The protocol is strictly synchronous and the client is single-threaded
//! and blocking by design; callers that need overlap run it on a worker.
//! There is no reconnection and no transport security beyond what the
//! remote shell binary provides.
//!
//! ```no_run
//! use rtape::{OpenAccMode, OpenFlags, default_client};
//!
//! # fn main() -> std::io::Result<()> {
//! let client = default_client();
//! let handle = client.open(
//!     "operator@backup1:/dev/nst0",
//!     OpenFlags::from(OpenAccMode::O_RDONLY),
//!     128,
//!     Some(std::path::Path::new("/usr/bin/ssh")),
//!     None,
//! )?;
//! let mut record = vec![0u8; 10240];
//! let got = client.read(handle - 128, &mut record)?;
//! client.close(handle - 128)?;
//! # let _ = got;
//! # Ok(())
//! # }
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub use crate::adapter::BLOCK_SIZE;
pub use crate::adapter::LocalFile;
pub use crate::adapter::Medium;
pub use crate::adapter::REMOTE_HANDLE_BIAS;
pub use crate::adapter::RemoteTape;
pub use crate::adapter::archive_medium;
pub use crate::handle::MAX_SESSIONS;
pub use crate::open_flags::OpenAccMode;
pub use crate::open_flags::OpenFlags;
pub use crate::open_flags::OpenOptions;
pub use crate::rsh::RemoteSpec;
pub use crate::rsh::spawn::DEFAULT_REMOTE_SHELL;
pub use crate::rsh::spawn::DEFAULT_RMT_COMMAND;
pub use crate::rsh::spawn::EXEC_FAILURE_STATUS;
pub use crate::session::RmtClient;
pub use crate::session::default_client;
pub use crate::tape::MTIOCGET;
pub use crate::tape::MTIOCTOP;
pub use crate::tape::MtGet;
pub use crate::tape::MtOp;
pub use crate::tape::TapeIoctl;

mod adapter;
mod errno;
mod handle;
mod open_flags;
mod rsh;
mod session;
mod tape;
mod transport;
mod wire;
