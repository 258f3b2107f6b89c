//! Forking the remote shell.
//!
//! The child gets the command pipe on its standard input and the reply pipe
//! on its standard output, drops any effective privileges back to the real
//! user, and becomes the remote shell. Everything the child touches after
//! the fork is prepared beforehand; between `fork` and `execv` only raw
//! syscalls run.

use std::ffi::CString;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use log::debug;
use log::warn;
use nix::unistd::ForkResult;
use nix::unistd::Gid;
use nix::unistd::Uid;
use nix::unistd::User;
use nix::unistd::fork;
use nix::unistd::pipe;
use smallvec::SmallVec;

use super::RemoteSpec;
use crate::transport::Transport;

/// Exit status of the child when `execv` (or anything before it) fails,
/// distinguishing "never became the remote shell" from a remote shell
/// that itself exited non-zero.
pub const EXEC_FAILURE_STATUS: i32 = 128;

/// Remote helper program used when the caller does not name one.
pub const DEFAULT_RMT_COMMAND: &str = env!("RTAPE_RMT_COMMAND");

/// Remote shell baked in at build time, if any.
pub const DEFAULT_REMOTE_SHELL: Option<&str> = option_env!("RTAPE_REMOTE_SHELL");

/// Real identity captured before forking. The passwd lookup may allocate,
/// so it cannot happen in the child.
struct RealIdentity {
    uid: Uid,
    gid: Gid,
    euid: Uid,
    egid: Gid,
    user_name: Option<CString>,
}

fn capture_identity() -> RealIdentity {
    let uid = nix::unistd::getuid();
    let user_name = match User::from_uid(uid) {
        Ok(Some(user)) => CString::new(user.name).ok(),
        Ok(None) => None,
        Err(err) => {
            warn!("passwd lookup for uid {uid} failed: {err}");
            None
        }
    };
    RealIdentity {
        uid,
        gid: nix::unistd::getgid(),
        euid: nix::unistd::geteuid(),
        egid: nix::unistd::getegid(),
        user_name,
    }
}

/// Resets effective ids back to the real ones. Runs in the child; must not
/// allocate. `EPERM` is tolerated (nothing to drop when unprivileged); any
/// other failure aborts the child.
fn reset_privileges(identity: &RealIdentity) -> Result<(), ()> {
    use nix::errno::Errno;

    if let Some(name) = identity.user_name.as_deref() {
        match nix::unistd::initgroups(name, identity.gid) {
            Ok(()) | Err(Errno::EPERM) => {}
            Err(_) => return Err(()),
        }
    }
    if identity.egid != identity.gid {
        match nix::unistd::setgid(identity.gid) {
            Ok(()) | Err(Errno::EPERM) => {}
            Err(_) => return Err(()),
        }
    }
    if identity.euid != identity.uid {
        match nix::unistd::setuid(identity.uid) {
            Ok(()) | Err(Errno::EPERM) => {}
            Err(_) => return Err(()),
        }
    }
    Ok(())
}

fn cstring(bytes: &[u8]) -> io::Result<CString> {
    CString::new(bytes).map_err(|_| io::Error::from_raw_os_error(libc::ENOENT))
}

/// Builds `argv` for the remote shell: its basename, the host, `-l user`
/// when a login was given, and the helper command to run remotely.
fn build_argv(
    rsh: &Path,
    spec: &RemoteSpec,
    rmt_command: &str,
) -> io::Result<SmallVec<[CString; 6]>> {
    let basename = rsh.file_name().unwrap_or(rsh.as_os_str());
    let mut argv = SmallVec::new();
    argv.push(cstring(basename.as_bytes())?);
    argv.push(cstring(spec.host.as_bytes())?);
    if let Some(user) = spec.user.as_deref() {
        argv.push(cstring(b"-l")?);
        argv.push(cstring(user.as_bytes())?);
    }
    argv.push(cstring(rmt_command.as_bytes())?);
    Ok(argv)
}

/// Forks the remote shell and returns the transport wired to it.
///
/// The child exists exactly as long as either pipe end is open in the
/// parent; dropping the transport makes it see end-of-file and exit. The
/// parent never reaps it.
#[cfg_attr(feature = "rexec", allow(dead_code))]
pub(crate) fn spawn_remote_shell(
    spec: &RemoteSpec,
    remote_shell: Option<&Path>,
    remote_command: Option<&str>,
) -> io::Result<Transport> {
    let rsh = match remote_shell {
        Some(path) => path,
        None => Path::new(
            DEFAULT_REMOTE_SHELL
                .ok_or_else(|| io::Error::from_raw_os_error(libc::EIO))?,
        ),
    };
    let rmt_command = remote_command.unwrap_or(DEFAULT_RMT_COMMAND);

    let rsh_c = cstring(rsh.as_os_str().as_bytes())?;
    let argv = build_argv(rsh, spec, rmt_command)?;
    let mut argv_ptrs: SmallVec<[*const libc::c_char; 8]> =
        argv.iter().map(|arg| arg.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());
    let identity = capture_identity();

    // Inbound from the child's point of view: commands. Outbound: replies.
    let (child_stdin_rd, child_stdin_wr) = pipe().map_err(io::Error::from)?;
    let (child_stdout_rd, child_stdout_wr) = pipe().map_err(io::Error::from)?;

    match unsafe { fork() }.map_err(io::Error::from)? {
        ForkResult::Child => {
            // Raw syscalls only from here on.
            let ok = unsafe {
                libc::dup2(child_stdin_rd.as_raw_fd(), libc::STDIN_FILENO) >= 0
                    && libc::dup2(child_stdout_wr.as_raw_fd(), libc::STDOUT_FILENO) >= 0
            };
            drop(child_stdin_rd);
            drop(child_stdin_wr);
            drop(child_stdout_rd);
            drop(child_stdout_wr);
            if ok && reset_privileges(&identity).is_ok() {
                unsafe {
                    libc::execv(rsh_c.as_ptr(), argv_ptrs.as_ptr());
                }
            }
            unsafe { libc::_exit(EXEC_FAILURE_STATUS) }
        }
        ForkResult::Parent { child } => {
            debug!(
                "remote shell {} pid {child} for {}:{}",
                rsh.display(),
                spec.host,
                spec.file
            );
            drop(child_stdin_rd);
            drop(child_stdout_wr);
            Ok(Transport::new(child_stdout_rd, child_stdin_wr))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> RemoteSpec {
        RemoteSpec {
            user: Some("operator".to_owned()),
            host: "backup1".to_owned(),
            file: "/dev/nst0".to_owned(),
        }
    }

    #[test]
    fn argv_uses_the_shell_basename() {
        let argv = build_argv(Path::new("/usr/bin/rsh"), &spec(), "/etc/rmt").unwrap();
        let strings: Vec<_> = argv.iter().map(|c| c.to_str().unwrap()).collect();
        assert_eq!(strings, ["rsh", "backup1", "-l", "operator", "/etc/rmt"]);
    }

    #[test]
    fn login_flag_is_omitted_without_a_user() {
        let mut spec = spec();
        spec.user = None;
        let argv = build_argv(Path::new("/usr/bin/ssh"), &spec, "/sbin/rmt").unwrap();
        let strings: Vec<_> = argv.iter().map(|c| c.to_str().unwrap()).collect();
        assert_eq!(strings, ["ssh", "backup1", "/sbin/rmt"]);
    }

    #[test]
    fn interior_nul_cannot_reach_exec() {
        assert!(build_argv(Path::new("/bin/rsh"), &spec(), "rmt\0oops").is_err());
    }
}
