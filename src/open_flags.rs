use bitflags::bitflags;
use std::fmt::Write;

/// How the remote file should be opened: read-only, write-only, or
/// read-write.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(i32)]
#[allow(non_camel_case_types)]
pub enum OpenAccMode {
    /// Open file for reading only.
    O_RDONLY = libc::O_RDONLY,
    /// Open file for writing only.
    O_WRONLY = libc::O_WRONLY,
    /// Open file for reading and writing.
    O_RDWR = libc::O_RDWR,
}

impl OpenAccMode {
    /// The canonical POSIX name of the access mode.
    pub fn name(self) -> &'static str {
        match self {
            OpenAccMode::O_RDONLY => "O_RDONLY",
            OpenAccMode::O_WRONLY => "O_WRONLY",
            OpenAccMode::O_RDWR => "O_RDWR",
        }
    }
}

bitflags! {
    /// Open flags beyond the access mode that survive transmission to the
    /// remote helper. `O_SYNC` precedes `O_DSYNC` so that on targets where
    /// the former subsumes the latter only the stronger name is printed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenOptions: i32 {
        /// Create the file if it does not exist.
        const O_CREAT = libc::O_CREAT;
        /// Fail if the file already exists.
        const O_EXCL = libc::O_EXCL;
        /// Do not make the device the controlling terminal.
        const O_NOCTTY = libc::O_NOCTTY;
        /// Truncate to zero length.
        const O_TRUNC = libc::O_TRUNC;
        /// Append on each write.
        const O_APPEND = libc::O_APPEND;
        /// Non-blocking open.
        const O_NONBLOCK = libc::O_NONBLOCK;
        /// Synchronised I/O file integrity completion.
        const O_SYNC = libc::O_SYNC;
        /// Synchronised I/O data integrity completion.
        const O_DSYNC = libc::O_DSYNC;
    }
}

/// Open flags as passed to the open operation.
///
/// The raw numeric value is what goes over the wire and is authoritative;
/// the symbolic rendition accompanies it for helpers on foreign systems
/// whose flag values differ.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct OpenFlags(pub i32);

impl OpenFlags {
    /// File access mode.
    pub fn acc_mode(self) -> OpenAccMode {
        match self.0 & libc::O_ACCMODE {
            libc::O_RDONLY => OpenAccMode::O_RDONLY,
            libc::O_WRONLY => OpenAccMode::O_WRONLY,
            libc::O_RDWR => OpenAccMode::O_RDWR,
            _ => {
                // Impossible combination of flags.
                // Do not panic because the field is public.
                OpenAccMode::O_RDONLY
            }
        }
    }

    /// The named flags present beyond the access mode. Unknown bits are
    /// dropped here; they still travel in the numeric form.
    pub fn options(self) -> OpenOptions {
        OpenOptions::from_bits_truncate(self.0 & !libc::O_ACCMODE)
    }

    /// Renders the `<numeric> <symbolic>` form used by the open command,
    /// e.g. `577 O_WRONLY|O_CREAT|O_TRUNC`.
    pub fn symbolic(self) -> String {
        let mut out = String::new();
        write!(out, "{} {}", self.0, self.acc_mode().name()).expect("write to String");
        for (name, _) in self.options().iter_names() {
            out.push('|');
            out.push_str(name);
        }
        out
    }
}

impl From<OpenAccMode> for OpenFlags {
    fn from(mode: OpenAccMode) -> OpenFlags {
        OpenFlags(mode as i32)
    }
}
