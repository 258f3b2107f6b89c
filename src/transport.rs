//! Byte transport to a remote helper process.
//!
//! A transport is nothing more than two owned pipe ends: one carrying
//! command lines and payloads to the remote, one carrying status lines and
//! payloads back. Closing both (by dropping the transport) is what makes
//! the remote child observe end-of-file and exit.

use std::io;
use std::os::fd::OwnedFd;

use log::warn;
use nix::sys::signal::SaFlags;
use nix::sys::signal::SigAction;
use nix::sys::signal::SigHandler;
use nix::sys::signal::SigSet;
use nix::sys::signal::Signal;
use nix::sys::signal::sigaction;

/// Bidirectional byte pipe to the remote helper.
#[derive(Debug)]
pub(crate) struct Transport {
    from_remote: OwnedFd,
    to_remote: OwnedFd,
}

/// Scope guard that ignores `SIGPIPE` and restores the previous disposition
/// when dropped, on every exit path including unwinding. A dead peer must
/// surface as `EPIPE` from `write`, not terminate the process.
struct SigPipeGuard {
    previous: SigAction,
}

impl SigPipeGuard {
    fn ignore() -> io::Result<SigPipeGuard> {
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        let previous = unsafe { sigaction(Signal::SIGPIPE, &ignore) }.map_err(io::Error::from)?;
        Ok(SigPipeGuard { previous })
    }
}

impl Drop for SigPipeGuard {
    fn drop(&mut self) {
        if let Err(err) = unsafe { sigaction(Signal::SIGPIPE, &self.previous) } {
            warn!("failed to restore SIGPIPE disposition: {err}");
        }
    }
}

impl Transport {
    pub(crate) fn new(from_remote: OwnedFd, to_remote: OwnedFd) -> Transport {
        Transport {
            from_remote,
            to_remote,
        }
    }

    /// Writes the whole buffer, with `SIGPIPE` masked for the duration.
    /// A short write that cannot be completed is an error; the caller is
    /// expected to tear the session down.
    pub(crate) fn send(&self, mut buf: &[u8]) -> io::Result<()> {
        let _guard = SigPipeGuard::ignore()?;
        while !buf.is_empty() {
            match nix::unistd::write(&self.to_remote, buf) {
                Ok(0) => return Err(io::Error::from_raw_os_error(libc::EIO)),
                Ok(n) => buf = &buf[n..],
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Reads exactly `buf.len()` bytes. End-of-file before the buffer is
    /// full is an error.
    pub(crate) fn recv_exact(&self, buf: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match nix::unistd::read(&self.from_remote, &mut buf[filled..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "remote closed the connection mid-payload",
                    ));
                }
                Ok(n) => filled += n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Reads a single byte; `Ok(None)` on end-of-file.
    pub(crate) fn recv_byte(&self) -> io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        loop {
            match nix::unistd::read(&self.from_remote, &mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(byte[0])),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::pipe;

    fn pair() -> (Transport, OwnedFd, OwnedFd) {
        let (reply_rd, reply_wr) = pipe().unwrap();
        let (cmd_rd, cmd_wr) = pipe().unwrap();
        (Transport::new(reply_rd, cmd_wr), reply_wr, cmd_rd)
    }

    #[test]
    fn send_is_byte_exact() {
        let (transport, _reply_wr, cmd_rd) = pair();
        transport.send(b"R100\n").unwrap();
        let mut buf = [0u8; 5];
        let n = nix::unistd::read(&cmd_rd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"R100\n");
    }

    #[test]
    fn recv_exact_reassembles_short_reads() {
        let (transport, reply_wr, _cmd_rd) = pair();
        nix::unistd::write(&reply_wr, b"abc").unwrap();
        nix::unistd::write(&reply_wr, b"def").unwrap();
        let mut buf = [0u8; 6];
        transport.recv_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"abcdef");
    }

    #[test]
    fn recv_exact_reports_eof() {
        let (transport, reply_wr, _cmd_rd) = pair();
        nix::unistd::write(&reply_wr, b"ab").unwrap();
        drop(reply_wr);
        let mut buf = [0u8; 4];
        let err = transport.recv_exact(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn recv_byte_sees_eof_as_none() {
        let (transport, reply_wr, _cmd_rd) = pair();
        drop(reply_wr);
        assert_eq!(transport.recv_byte().unwrap(), None);
    }

    #[test]
    fn dead_peer_surfaces_as_epipe_not_a_signal() {
        let (transport, _reply_wr, cmd_rd) = pair();
        drop(cmd_rd);
        let err = transport.send(b"C\n").unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EPIPE));
    }
}
