//! Alternate connection path over the historical BSD `rexec(3)` call.
//!
//! Instead of forking a remote shell, the libc resolves the exec service
//! and hands back a single bidirectional socket. `rexec` may prompt for
//! credentials on standard input/output, so both are parked on the
//! controlling terminal for the duration and restored afterwards.

use std::ffi::CString;
use std::io;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;

use log::debug;

use super::RemoteSpec;
use crate::transport::Transport;

// Not exported by the libc crate; declared the way the platform headers do.
unsafe extern "C" {
    fn rexec(
        ahost: *mut *mut libc::c_char,
        inport: libc::c_int,
        user: *const libc::c_char,
        passwd: *const libc::c_char,
        cmd: *const libc::c_char,
        fd2p: *mut libc::c_int,
    ) -> libc::c_int;
}

/// Port of the exec service, network byte order as `rexec` expects.
fn exec_service_port() -> libc::c_int {
    let name = CString::new("exec").expect("no interior NUL");
    let proto = CString::new("tcp").expect("no interior NUL");
    let servent = unsafe { libc::getservbyname(name.as_ptr(), proto.as_ptr()) };
    if servent.is_null() {
        // The registered port when no services database is present.
        512u16.to_be() as libc::c_int
    } else {
        unsafe { (*servent).s_port }
    }
}

/// Parks stdin/stdout on the controlling terminal, restoring the originals
/// on drop so an authentication failure cannot leave them redirected.
struct TtyStdio {
    saved_stdin: libc::c_int,
    saved_stdout: libc::c_int,
}

impl TtyStdio {
    fn redirect() -> io::Result<TtyStdio> {
        let tty = CString::new("/dev/tty").expect("no interior NUL");
        let tty_fd = unsafe { libc::open(tty.as_ptr(), libc::O_RDWR) };
        if tty_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let saved_stdin = unsafe { libc::dup(libc::STDIN_FILENO) };
        let saved_stdout = unsafe { libc::dup(libc::STDOUT_FILENO) };
        let ok = saved_stdin >= 0
            && saved_stdout >= 0
            && unsafe { libc::dup2(tty_fd, libc::STDIN_FILENO) } >= 0
            && unsafe { libc::dup2(tty_fd, libc::STDOUT_FILENO) } >= 0;
        let err = io::Error::last_os_error();
        unsafe {
            libc::close(tty_fd);
        }
        if ok {
            Ok(TtyStdio {
                saved_stdin,
                saved_stdout,
            })
        } else {
            unsafe {
                if saved_stdin >= 0 {
                    libc::close(saved_stdin);
                }
                if saved_stdout >= 0 {
                    libc::close(saved_stdout);
                }
            }
            Err(err)
        }
    }
}

impl Drop for TtyStdio {
    fn drop(&mut self) {
        unsafe {
            libc::dup2(self.saved_stdin, libc::STDIN_FILENO);
            libc::dup2(self.saved_stdout, libc::STDOUT_FILENO);
            libc::close(self.saved_stdin);
            libc::close(self.saved_stdout);
        }
    }
}

/// Connects to the remote helper through `rexec`, duplicating the socket
/// so the transport owns one descriptor per direction.
pub(crate) fn connect(spec: &RemoteSpec, remote_command: Option<&str>) -> io::Result<Transport> {
    let command = remote_command.unwrap_or(super::spawn::DEFAULT_RMT_COMMAND);
    let host = CString::new(spec.host.as_str())
        .map_err(|_| io::Error::from_raw_os_error(libc::ENOENT))?;
    let user = match spec.user.as_deref() {
        Some(user) => Some(
            CString::new(user).map_err(|_| io::Error::from_raw_os_error(libc::ENOENT))?,
        ),
        None => None,
    };
    let command = CString::new(command)
        .map_err(|_| io::Error::from_raw_os_error(libc::ENOENT))?;

    let socket = {
        let _stdio = TtyStdio::redirect()?;
        let mut ahost = host.as_ptr().cast_mut();
        unsafe {
            rexec(
                &mut ahost,
                exec_service_port(),
                user.as_deref().map_or(std::ptr::null(), |u| u.as_ptr()),
                std::ptr::null(),
                command.as_ptr(),
                std::ptr::null_mut(),
            )
        }
    };
    if socket < 0 {
        return Err(io::Error::last_os_error());
    }
    let duplicate = unsafe { libc::dup(socket) };
    if duplicate < 0 {
        let err = io::Error::last_os_error();
        unsafe {
            libc::close(socket);
        }
        return Err(err);
    }
    debug!("rexec connection to {} established", spec.host);
    let from_remote = unsafe { OwnedFd::from_raw_fd(socket) };
    let to_remote = unsafe { OwnedFd::from_raw_fd(duplicate) };
    Ok(Transport::new(from_remote, to_remote))
}
