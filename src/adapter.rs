//! Glue between tape sessions and a buffered archive layer.
//!
//! Archive engines drive their media through a small callback surface:
//! open, read, write, seek, close, plus a destructor. [`Medium`] is that
//! surface; [`RemoteTape`] implements it on top of a [`RmtClient`] and
//! [`LocalFile`] on top of an ordinary file, so the layer above buffers
//! records without caring where the bytes land. Record blocking itself
//! stays above this seam.

use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

use crate::open_flags::OpenAccMode;
use crate::open_flags::OpenFlags;
use crate::rsh::RemoteSpec;
use crate::session::RmtClient;
use crate::session::default_client;
use crate::tape::MtGet;
use crate::tape::MtOp;

/// Size of one archive block; records are a whole number of these.
pub const BLOCK_SIZE: usize = 512;

/// Added to remote handles so the surrounding program can tell them apart
/// from local file descriptors by numeric range.
pub const REMOTE_HANDLE_BIAS: i32 = 128;

/// Byte-stream callbacks an archive buffer drives its medium through.
/// Dropping the medium is the destructor callback.
pub trait Medium {
    /// Makes the medium ready for I/O.
    fn open_medium(&mut self) -> io::Result<()>;
    /// Reads into `buf`, returning 0 at end-of-medium.
    fn read_medium(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    /// Writes from `buf`, possibly short.
    fn write_medium(&mut self, buf: &[u8]) -> io::Result<usize>;
    /// Repositions the medium, returning the new offset.
    fn seek_medium(&mut self, pos: SeekFrom) -> io::Result<i64>;
    /// Flushes and detaches from the medium.
    fn close_medium(&mut self) -> io::Result<()>;
}

/// Chooses the medium for an archive name: remote when the name uses
/// `[user@]host:file` syntax, local otherwise. `force_local` suppresses
/// the remote syntax entirely, so names with colons stay local paths.
pub fn archive_medium(name: &str, flags: OpenFlags, force_local: bool) -> Box<dyn Medium> {
    if !force_local && RemoteSpec::looks_remote(name) {
        Box::new(RemoteTape::new(name, flags))
    } else {
        Box::new(LocalFile::new(name, flags))
    }
}

/// A tape drive on another host, reached through the rmt protocol.
#[derive(Debug)]
pub struct RemoteTape {
    client: &'static RmtClient,
    file_name: String,
    flags: OpenFlags,
    remote_shell: Option<PathBuf>,
    remote_command: Option<String>,
    block_factor: usize,
    handle: Option<i32>,
}

impl RemoteTape {
    /// A medium for `[user@]host:file`, not yet opened. The default
    /// blocking factor matches the historical archiver default.
    pub fn new(file_name: impl Into<String>, flags: OpenFlags) -> RemoteTape {
        RemoteTape {
            client: default_client(),
            file_name: file_name.into(),
            flags,
            remote_shell: None,
            remote_command: None,
            block_factor: 20,
            handle: None,
        }
    }

    /// Uses a dedicated client instead of the process-wide one.
    pub fn with_client(mut self, client: &'static RmtClient) -> RemoteTape {
        self.client = client;
        self
    }

    /// Path of the remote-shell binary to fork.
    pub fn remote_shell(mut self, path: impl Into<PathBuf>) -> RemoteTape {
        self.remote_shell = Some(path.into());
        self
    }

    /// Path of the helper to run on the remote host.
    pub fn remote_command(mut self, command: impl Into<String>) -> RemoteTape {
        self.remote_command = Some(command.into());
        self
    }

    /// Blocking factor for the archive layer above.
    pub fn block_factor(mut self, factor: usize) -> RemoteTape {
        self.block_factor = factor;
        self
    }

    /// Bytes per record at the configured blocking factor.
    pub fn record_size(&self) -> usize {
        self.block_factor * BLOCK_SIZE
    }

    fn unbiased(&self) -> io::Result<i32> {
        self.handle
            .map(|handle| handle - REMOTE_HANDLE_BIAS)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }

    /// Issues a tape operation on the open medium.
    pub fn operation(&mut self, op: MtOp, count: i64) -> io::Result<i64> {
        self.client.operation(self.unbiased()?, op, count)
    }

    /// Retrieves drive status from the open medium.
    pub fn status(&mut self) -> io::Result<MtGet> {
        self.client.get_status(self.unbiased()?)
    }
}

impl Medium for RemoteTape {
    fn open_medium(&mut self) -> io::Result<()> {
        let handle = self.client.open(
            &self.file_name,
            self.flags,
            REMOTE_HANDLE_BIAS,
            self.remote_shell.as_deref(),
            self.remote_command.as_deref(),
        )?;
        self.handle = Some(handle);
        Ok(())
    }

    fn read_medium(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.client.read(self.unbiased()?, buf)
    }

    fn write_medium(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.client.write(self.unbiased()?, buf)
    }

    fn seek_medium(&mut self, pos: SeekFrom) -> io::Result<i64> {
        self.client.seek(self.unbiased()?, pos)
    }

    fn close_medium(&mut self) -> io::Result<()> {
        let handle = self.unbiased()?;
        self.handle = None;
        self.client.close(handle).map(|_| ())
    }
}

impl Drop for RemoteTape {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.close_medium();
        }
    }
}

/// A local file or device presented through the same callback surface.
#[derive(Debug)]
pub struct LocalFile {
    path: PathBuf,
    flags: OpenFlags,
    file: Option<File>,
}

impl LocalFile {
    /// A local medium for `path`, not yet opened.
    pub fn new(path: impl Into<PathBuf>, flags: OpenFlags) -> LocalFile {
        LocalFile {
            path: path.into(),
            flags,
            file: None,
        }
    }

    fn file(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }
}

impl Medium for LocalFile {
    fn open_medium(&mut self) -> io::Result<()> {
        let acc_mode = self.flags.acc_mode();
        let options = self.flags.options();
        let file = OpenOptions::new()
            .read(acc_mode != OpenAccMode::O_WRONLY)
            .write(acc_mode != OpenAccMode::O_RDONLY)
            .create(options.contains(crate::open_flags::OpenOptions::O_CREAT))
            .truncate(options.contains(crate::open_flags::OpenOptions::O_TRUNC))
            .append(options.contains(crate::open_flags::OpenOptions::O_APPEND))
            .custom_flags(
                self.flags.0
                    & !(libc::O_ACCMODE | libc::O_CREAT | libc::O_TRUNC | libc::O_APPEND),
            )
            .open(&self.path)?;
        self.file = Some(file);
        Ok(())
    }

    fn read_medium(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file()?.read(buf)
    }

    fn write_medium(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file()?.write(buf)
    }

    fn seek_medium(&mut self, pos: SeekFrom) -> io::Result<i64> {
        let offset = self.file()?.seek(pos)?;
        i64::try_from(offset).map_err(|_| io::Error::from_raw_os_error(libc::EOVERFLOW))
    }

    fn close_medium(&mut self) -> io::Result<()> {
        self.file = None;
        Ok(())
    }
}
