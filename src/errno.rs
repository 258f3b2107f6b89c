use std::io;
use std::num::NonZeroI32;

/// An error number reported by the remote helper.
///
/// The remote side transmits raw errno values and they are trusted verbatim;
/// no translation between the local and remote errno tables is attempted.
/// Callers only ever see these as `io::Error` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Errno(NonZeroI32);

impl Errno {
    /// The raw error number.
    pub(crate) fn code(self) -> i32 {
        self.0.get()
    }

    /// Builds an `Errno` from a decoded reply value. Values that cannot
    /// name a failure (zero or negative) normalise to `EIO`.
    pub(crate) fn from_reply(code: i64) -> Errno {
        let code = i32::try_from(code).unwrap_or(0);
        match NonZeroI32::new(code) {
            Some(n) if code > 0 => Errno(n),
            _ => Errno(NonZeroI32::new(libc::EIO).expect("EIO is non-zero")),
        }
    }
}

impl From<Errno> for io::Error {
    fn from(errno: Errno) -> io::Error {
        io::Error::from_raw_os_error(errno.code())
    }
}

impl std::fmt::Display for Errno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "errno {}", self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_codes_pass_through() {
        assert_eq!(Errno::from_reply(libc::EACCES as i64).code(), libc::EACCES);
    }

    #[test]
    fn non_positive_codes_normalise_to_eio() {
        assert_eq!(Errno::from_reply(0).code(), libc::EIO);
        assert_eq!(Errno::from_reply(-7).code(), libc::EIO);
        assert_eq!(Errno::from_reply(i64::MAX).code(), libc::EIO);
    }

    #[test]
    fn converts_to_io_error() {
        let err: io::Error = Errno::from_reply(libc::ENOSPC as i64).into();
        assert_eq!(err.raw_os_error(), Some(libc::ENOSPC));
    }
}
