//! Wire encoding of commands and parsing of status replies.
//!
//! Commands are single ASCII letters with newline-terminated decimal
//! arguments. Replies are one line starting with `A` (success plus a
//! count), `E` (error plus errno and a message line) or `F` (like `E`, but
//! the connection is beyond recovery). The legacy get-status command `S`
//! is the one command sent without a trailing newline.

use std::io;

use smallvec::SmallVec;

use crate::errno::Errno;
use crate::open_flags::OpenFlags;
use crate::transport::Transport;

/// Longest status line the protocol allows, including the status letter
/// but excluding the newline.
const STATUS_LINE_LIMIT: usize = 64;

/// Inline buffer for an outbound command line. Commands are tiny; only a
/// pathologically long file name in `O` spills to the heap.
pub(crate) type CommandBuf = SmallVec<[u8; 64]>;

/// How an exchange with the remote went wrong.
#[derive(Debug)]
pub(crate) enum WireError {
    /// The remote reported an errno. `fatal` is true for `F` replies,
    /// which mandate teardown; plain `E` leaves the session usable.
    Peer { errno: Errno, fatal: bool },
    /// The byte stream no longer looks like the protocol. Always fatal.
    Protocol(&'static str),
    /// The transport itself failed. Always fatal.
    Io(io::Error),
}

impl WireError {
    /// Whether the session must be torn down before returning.
    pub(crate) fn is_fatal(&self) -> bool {
        !matches!(self, WireError::Peer { fatal: false, .. })
    }

    pub(crate) fn into_io(self) -> io::Error {
        match self {
            WireError::Peer { errno, .. } => errno.into(),
            WireError::Protocol(_) => io::Error::from_raw_os_error(libc::EIO),
            WireError::Io(err) => err,
        }
    }
}

impl From<io::Error> for WireError {
    fn from(err: io::Error) -> WireError {
        WireError::Io(err)
    }
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Peer { errno, fatal: true } => write!(f, "fatal remote error, {errno}"),
            WireError::Peer { errno, fatal: false } => write!(f, "remote error, {errno}"),
            WireError::Protocol(what) => write!(f, "protocol violation: {what}"),
            WireError::Io(err) => write!(f, "transport failure: {err}"),
        }
    }
}

fn push_decimal(buf: &mut CommandBuf, value: i64) {
    let mut digits = [0u8; 20];
    let mut n = digits.len();
    let negative = value < 0;
    let mut rest = value.unsigned_abs();
    loop {
        n -= 1;
        digits[n] = b'0' + (rest % 10) as u8;
        rest /= 10;
        if rest == 0 {
            break;
        }
    }
    if negative {
        buf.push(b'-');
    }
    buf.extend_from_slice(&digits[n..]);
}

pub(crate) fn encode_open(file: &str, flags: OpenFlags) -> CommandBuf {
    let mut buf = CommandBuf::new();
    buf.push(b'O');
    buf.extend_from_slice(file.as_bytes());
    buf.push(b'\n');
    buf.extend_from_slice(flags.symbolic().as_bytes());
    buf.push(b'\n');
    buf
}

pub(crate) fn encode_close() -> CommandBuf {
    CommandBuf::from_slice(b"C\n")
}

pub(crate) fn encode_read(len: usize) -> CommandBuf {
    let mut buf = CommandBuf::new();
    buf.push(b'R');
    push_decimal(&mut buf, len as i64);
    buf.push(b'\n');
    buf
}

pub(crate) fn encode_write(len: usize) -> CommandBuf {
    let mut buf = CommandBuf::new();
    buf.push(b'W');
    push_decimal(&mut buf, len as i64);
    buf.push(b'\n');
    buf
}

pub(crate) fn encode_seek(whence: i32, offset: i64) -> CommandBuf {
    let mut buf = CommandBuf::new();
    buf.push(b'L');
    push_decimal(&mut buf, whence as i64);
    buf.push(b'\n');
    push_decimal(&mut buf, offset);
    buf.push(b'\n');
    buf
}

pub(crate) fn encode_operation(op: i32, count: i64) -> CommandBuf {
    let mut buf = CommandBuf::new();
    buf.push(b'I');
    push_decimal(&mut buf, op as i64);
    buf.push(b'\n');
    push_decimal(&mut buf, count);
    buf.push(b'\n');
    buf
}

/// The get-status command. Deliberately no trailing newline; historical
/// helpers read exactly one byte for it.
pub(crate) fn encode_get_status() -> CommandBuf {
    CommandBuf::from_slice(b"S")
}

/// Parses an ASCII decimal with overflow detection. Empty input, stray
/// bytes and values that do not fit an `i64` are all rejected.
fn parse_decimal(bytes: &[u8]) -> Option<i64> {
    let (negative, digits) = match bytes.split_first()? {
        (b'-', rest) => (true, rest),
        _ => (false, bytes),
    };
    if digits.is_empty() {
        return None;
    }
    let mut value: i64 = 0;
    for byte in digits {
        if !byte.is_ascii_digit() {
            return None;
        }
        value = value.checked_mul(10)?;
        let digit = (byte - b'0') as i64;
        value = if negative {
            value.checked_sub(digit)?
        } else {
            value.checked_add(digit)?
        };
    }
    Some(value)
}

/// Reads one status line, one byte at a time, into a bounded buffer.
fn read_status_line(transport: &Transport) -> Result<SmallVec<[u8; STATUS_LINE_LIMIT]>, WireError> {
    let mut line = SmallVec::new();
    loop {
        if line.len() == STATUS_LINE_LIMIT {
            return Err(WireError::Protocol("status line overflows 64 bytes"));
        }
        match transport.recv_byte()? {
            None if line.is_empty() => {
                return Err(WireError::Protocol("connection closed before status"));
            }
            None => return Err(WireError::Protocol("connection closed mid status line")),
            Some(b'\n') => return Ok(line),
            Some(byte) => line.push(byte),
        }
    }
}

/// Consumes and discards the message line that follows an `E`/`F` status.
fn drain_message_line(transport: &Transport) -> Result<(), WireError> {
    loop {
        match transport.recv_byte()? {
            None => return Err(WireError::Protocol("connection closed mid error message")),
            Some(b'\n') => return Ok(()),
            Some(_) => continue,
        }
    }
}

/// Reads and dispatches one status reply, returning the `A` count.
///
/// Leading spaces before the status letter are tolerated. Anything other
/// than `A`, `E` or `F` there means the stream is desynchronised.
pub(crate) fn read_reply(transport: &Transport) -> Result<i64, WireError> {
    let line = read_status_line(transport)?;
    let rest = match line.iter().position(|byte| *byte != b' ') {
        Some(start) => &line[start..],
        None => return Err(WireError::Protocol("empty status line")),
    };
    let (letter, args) = rest.split_first().expect("rest is non-empty");
    match *letter {
        b'A' => match parse_decimal(args) {
            Some(count) if count >= 0 => Ok(count),
            Some(_) => Err(WireError::Protocol("negative success count")),
            None => Err(WireError::Protocol("unparsable success count")),
        },
        b'E' | b'F' => {
            let errno = match parse_decimal(args) {
                Some(code) => Errno::from_reply(code),
                None => return Err(WireError::Protocol("unparsable errno")),
            };
            drain_message_line(transport)?;
            Err(WireError::Peer {
                errno,
                fatal: *letter == b'F',
            })
        }
        _ => Err(WireError::Protocol("desynchronised status stream")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::pipe;
    use std::os::fd::OwnedFd;

    fn scripted(reply: &[u8]) -> (Transport, OwnedFd) {
        let (reply_rd, reply_wr) = pipe().unwrap();
        let (_cmd_rd, cmd_wr) = pipe().unwrap();
        nix::unistd::write(&reply_wr, reply).unwrap();
        drop(reply_wr);
        (Transport::new(reply_rd, cmd_wr), _cmd_rd)
    }

    #[test]
    fn open_encoding_is_byte_exact() {
        let buf = encode_open("/dev/tape", OpenFlags(libc::O_RDONLY));
        assert_eq!(&buf[..], b"O/dev/tape\n0 O_RDONLY\n");
    }

    #[test]
    fn remaining_commands_encode_byte_exact() {
        assert_eq!(&encode_close()[..], b"C\n");
        assert_eq!(&encode_read(100)[..], b"R100\n");
        assert_eq!(&encode_write(0)[..], b"W0\n");
        assert_eq!(&encode_seek(2, -512)[..], b"L2\n-512\n");
        assert_eq!(&encode_operation(6, 1)[..], b"I6\n1\n");
        assert_eq!(&encode_get_status()[..], b"S");
    }

    #[test]
    fn parses_a_success_count() {
        let (transport, _cmd) = scripted(b"A42\n");
        assert_eq!(read_reply(&transport).unwrap(), 42);
    }

    #[test]
    fn tolerates_leading_spaces() {
        let (transport, _cmd) = scripted(b"   A7\n");
        assert_eq!(read_reply(&transport).unwrap(), 7);
        let (transport, _cmd) = scripted(b"  E13\nPermission denied\n");
        match read_reply(&transport).unwrap_err() {
            WireError::Peer { errno, fatal } => {
                assert_eq!(errno.code(), 13);
                assert!(!fatal);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn error_reply_consumes_the_message_line() {
        let (transport, _cmd) = scripted(b"E13\nPermission denied\nA5\n");
        assert!(matches!(
            read_reply(&transport),
            Err(WireError::Peer { fatal: false, .. })
        ));
        // The stream is positioned at the next status line.
        assert_eq!(read_reply(&transport).unwrap(), 5);
    }

    #[test]
    fn fatal_reply_is_flagged() {
        let (transport, _cmd) = scripted(b"F5\nI/O error\n");
        match read_reply(&transport).unwrap_err() {
            WireError::Peer { errno, fatal } => {
                assert_eq!(errno.code(), 5);
                assert!(fatal);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn garbage_status_letter_is_desync() {
        let (transport, _cmd) = scripted(b"  X1\n");
        assert!(matches!(
            read_reply(&transport),
            Err(WireError::Protocol(_))
        ));
    }

    #[test]
    fn status_line_boundary() {
        // 63 bytes plus the newline is accepted.
        let mut ok = vec![b' '; 61];
        ok.extend_from_slice(b"A9");
        ok.push(b'\n');
        assert_eq!(ok.len(), 64);
        let (transport, _cmd) = scripted(&ok);
        assert_eq!(read_reply(&transport).unwrap(), 9);

        // 64 bytes with no newline in sight is a protocol error.
        let overlong = vec![b'A'; 80];
        let (transport, _cmd) = scripted(&overlong);
        assert!(matches!(
            read_reply(&transport),
            Err(WireError::Protocol(_))
        ));
    }

    #[test]
    fn overflowing_offset_is_rejected() {
        let (transport, _cmd) = scripted(b"A99999999999999999999999\n");
        assert!(matches!(
            read_reply(&transport),
            Err(WireError::Protocol(_))
        ));
    }

    #[test]
    fn zero_errno_normalises_to_eio_without_teardown() {
        let (transport, _cmd) = scripted(b"E0\nhuh\n");
        match read_reply(&transport).unwrap_err() {
            WireError::Peer { errno, fatal } => {
                assert_eq!(errno.code(), libc::EIO);
                assert!(!fatal);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn eof_before_any_status_byte_is_fatal() {
        let (transport, _cmd) = scripted(b"");
        assert!(matches!(
            read_reply(&transport),
            Err(WireError::Protocol(_))
        ));
    }

    #[test]
    fn decimal_parser_edges() {
        assert_eq!(parse_decimal(b"0"), Some(0));
        assert_eq!(parse_decimal(b"-1"), Some(-1));
        assert_eq!(parse_decimal(b"9223372036854775807"), Some(i64::MAX));
        assert_eq!(parse_decimal(b"-9223372036854775808"), Some(i64::MIN));
        assert_eq!(parse_decimal(b"9223372036854775808"), None);
        assert_eq!(parse_decimal(b""), None);
        assert_eq!(parse_decimal(b"-"), None);
        assert_eq!(parse_decimal(b"12x"), None);
    }
}
