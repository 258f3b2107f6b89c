//! Establishing connections to the remote helper.
//!
//! `[user@]host:file` names are taken apart here, the host is resolved as a
//! sanity check, and `spawn` forks the remote shell that carries the actual
//! byte stream. The protocol is newline-delimited and has no quoting, so a
//! newline anywhere in the name is rejected outright.

use std::io;
use std::net::ToSocketAddrs;

#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

#[cfg(feature = "rexec")]
pub(crate) mod rexec;
pub(crate) mod spawn;

/// The parsed form of a `[user@]host:file` archive name.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct RemoteSpec {
    /// Login name on the remote host, when one was given.
    pub user: Option<String>,
    /// Host carrying the tape device.
    pub host: String,
    /// Device or file path on the remote host.
    pub file: String,
}

fn bad_name() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOENT)
}

impl RemoteSpec {
    /// Whether a name uses the remote syntax at all.
    pub fn looks_remote(name: &str) -> bool {
        memchr::memchr(b':', name.as_bytes()).is_some()
    }

    /// Splits a `[user@]host:file` name.
    ///
    /// One left-to-right pass: the first `@` splits off the user only when
    /// it precedes the first `:`, the first `:` splits off the file, and
    /// later occurrences of either separator belong to the file. An empty
    /// user is normalised to absent; an empty host or file is rejected, as
    /// is a newline anywhere.
    pub fn parse(name: &str) -> io::Result<RemoteSpec> {
        let bytes = name.as_bytes();
        if memchr::memchr(b'\n', bytes).is_some() {
            return Err(bad_name());
        }
        let colon = memchr::memchr(b':', bytes).ok_or_else(bad_name)?;
        let (user, host_start) = match memchr::memchr(b'@', &bytes[..colon]) {
            Some(at) if at > 0 => (Some(name[..at].to_owned()), at + 1),
            Some(at) => (None, at + 1),
            None => (None, 0),
        };
        let host = &name[host_start..colon];
        let file = &name[colon + 1..];
        if host.is_empty() || file.is_empty() {
            return Err(bad_name());
        }
        Ok(RemoteSpec {
            user,
            host: host.to_owned(),
            file: file.to_owned(),
        })
    }
}

/// Best-effort host lookup before anything is forked. The remote shell does
/// its own connecting; this only rejects names no resolver knows.
pub(crate) fn resolve_host(host: &str) -> io::Result<()> {
    let mut addrs = (host, 0u16)
        .to_socket_addrs()
        .map_err(|err| io::Error::other(format!("cannot resolve {host}: {err}")))?;
    if addrs.next().is_some() {
        Ok(())
    } else {
        Err(io::Error::other(format!("unknown host {host}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_user_host_and_file() {
        let spec = RemoteSpec::parse("amanda@backup1:/dev/nst0").unwrap();
        assert_eq!(spec.user.as_deref(), Some("amanda"));
        assert_eq!(spec.host, "backup1");
        assert_eq!(spec.file, "/dev/nst0");
    }

    #[test]
    fn user_is_optional() {
        let spec = RemoteSpec::parse("backup1:/dev/nst0").unwrap();
        assert_eq!(spec.user, None);
        assert_eq!(spec.host, "backup1");
    }

    #[test]
    fn empty_user_normalises_to_absent() {
        let spec = RemoteSpec::parse("@backup1:/dev/nst0").unwrap();
        assert_eq!(spec.user, None);
        assert_eq!(spec.host, "backup1");
    }

    #[test]
    fn at_sign_after_the_colon_belongs_to_the_file() {
        let spec = RemoteSpec::parse("backup1:/tmp/odd@name").unwrap();
        assert_eq!(spec.user, None);
        assert_eq!(spec.host, "backup1");
        assert_eq!(spec.file, "/tmp/odd@name");
    }

    #[test]
    fn duplicate_separators_are_ignored() {
        let spec = RemoteSpec::parse("a@b@host:dir:file").unwrap();
        assert_eq!(spec.user.as_deref(), Some("a"));
        assert_eq!(spec.host, "b@host");
        assert_eq!(spec.file, "dir:file");
    }

    #[test]
    fn rejects_newlines_anywhere() {
        for name in ["host:\n/dev/nst0", "ho\nst:/dev/nst0", "u\n@host:f"] {
            let err = RemoteSpec::parse(name).unwrap_err();
            assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
        }
    }

    #[test]
    fn rejects_missing_pieces() {
        for name in ["nodevice", ":file", "host:", "@:file", ""] {
            assert!(RemoteSpec::parse(name).is_err(), "{name:?}");
        }
    }

    #[test]
    fn looks_remote_is_a_cheap_screen() {
        assert!(RemoteSpec::looks_remote("host:/dev/nst0"));
        assert!(!RemoteSpec::looks_remote("/dev/nst0"));
    }

    #[test]
    fn localhost_resolves() {
        resolve_host("localhost").unwrap();
    }
}
