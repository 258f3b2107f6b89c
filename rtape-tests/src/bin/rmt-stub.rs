//! Miniature rmt helper used by the end-to-end tests.
//!
//! Speaks the rmt protocol on its standard streams and performs the
//! requested operations on local files, the way the real helper does on
//! the remote host. The client invokes it in place of the remote shell,
//! so the host/user/command arguments are accepted and ignored.

use std::ffi::CString;
use std::io;
use std::io::BufReader;
use std::io::Read;
use std::io::Write;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use zerocopy::IntoBytes;

use rtape::MtGet;

fn read_line(input: &mut impl Read) -> Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        input.read_exact(&mut byte).context("command truncated")?;
        if byte[0] == b'\n' {
            let line = String::from_utf8(line).context("non-ascii command")?;
            return Ok(line);
        }
        line.push(byte[0]);
    }
}

fn reply_count(output: &mut impl Write, count: i64) -> Result<()> {
    write!(output, "A{count}\n")?;
    output.flush()?;
    Ok(())
}

fn reply_error(output: &mut impl Write, errno: i32) -> Result<()> {
    let message = io::Error::from_raw_os_error(errno);
    write!(output, "E{errno}\n{message}\n")?;
    output.flush()?;
    Ok(())
}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

struct Drive {
    fd: libc::c_int,
}

impl Drive {
    fn new() -> Drive {
        Drive { fd: -1 }
    }

    fn open(&mut self, path: &str, flags: i32) -> std::result::Result<(), i32> {
        self.close();
        let path = CString::new(path).map_err(|_| libc::ENOENT)?;
        let fd = unsafe { libc::open(path.as_ptr(), flags, 0o666) };
        if fd < 0 {
            return Err(last_errno());
        }
        self.fd = fd;
        Ok(())
    }

    fn close(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
            self.fd = -1;
        }
    }

    fn read(&mut self, count: usize) -> std::result::Result<Vec<u8>, i32> {
        let mut buf = vec![0u8; count];
        let got = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), count) };
        if got < 0 {
            return Err(last_errno());
        }
        buf.truncate(got as usize);
        Ok(buf)
    }

    fn write(&mut self, buf: &[u8]) -> std::result::Result<usize, i32> {
        let mut written = 0;
        while written < buf.len() {
            let n = unsafe {
                libc::write(
                    self.fd,
                    buf[written..].as_ptr().cast(),
                    buf.len() - written,
                )
            };
            if n < 0 {
                return Err(last_errno());
            }
            written += n as usize;
        }
        Ok(written)
    }

    fn seek(&mut self, whence: i32, offset: i64) -> std::result::Result<i64, i32> {
        let pos = unsafe { libc::lseek(self.fd, offset as libc::off_t, whence) };
        if pos < 0 {
            return Err(last_errno());
        }
        Ok(pos)
    }
}

impl Drop for Drive {
    fn drop(&mut self) {
        self.close();
    }
}

fn main() -> Result<()> {
    let mut input = BufReader::new(io::stdin());
    let mut output = io::stdout();
    let mut drive = Drive::new();

    loop {
        let mut cmd = [0u8; 1];
        match input.read_exact(&mut cmd) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err.into()),
        }
        match cmd[0] {
            b'O' => {
                let path = read_line(&mut input)?;
                let flags_line = read_line(&mut input)?;
                // The numeric form is authoritative; the symbolic names
                // after it are informational.
                let flags: i32 = flags_line
                    .split_whitespace()
                    .next()
                    .unwrap_or("")
                    .parse()
                    .context("unparsable open flags")?;
                match drive.open(&path, flags) {
                    Ok(()) => reply_count(&mut output, 0)?,
                    Err(errno) => reply_error(&mut output, errno)?,
                }
            }
            b'C' => {
                read_line(&mut input)?;
                drive.close();
                reply_count(&mut output, 0)?;
            }
            b'R' => {
                let count: usize = read_line(&mut input)?.parse().context("bad read count")?;
                match drive.read(count) {
                    Ok(data) => {
                        reply_count(&mut output, data.len() as i64)?;
                        output.write_all(&data)?;
                        output.flush()?;
                    }
                    Err(errno) => reply_error(&mut output, errno)?,
                }
            }
            b'W' => {
                let count: usize = read_line(&mut input)?.parse().context("bad write count")?;
                let mut payload = vec![0u8; count];
                input.read_exact(&mut payload).context("payload truncated")?;
                match drive.write(&payload) {
                    Ok(written) => reply_count(&mut output, written as i64)?,
                    Err(errno) => reply_error(&mut output, errno)?,
                }
            }
            b'L' => {
                let whence: i32 = read_line(&mut input)?.parse().context("bad whence")?;
                let offset: i64 = read_line(&mut input)?.parse().context("bad offset")?;
                match drive.seek(whence, offset) {
                    Ok(pos) => reply_count(&mut output, pos)?,
                    Err(errno) => reply_error(&mut output, errno)?,
                }
            }
            b'I' => {
                let _op: i32 = read_line(&mut input)?.parse().context("bad tape op")?;
                let count: i64 = read_line(&mut input)?.parse().context("bad op count")?;
                // Plain files have no tape ioctls; pretend the drive obliged.
                reply_count(&mut output, count)?;
            }
            b'S' => {
                let status = MtGet {
                    mt_type: 1,
                    ..MtGet::default()
                };
                let bytes = status.as_bytes();
                reply_count(&mut output, bytes.len() as i64)?;
                output.write_all(bytes)?;
                output.flush()?;
            }
            other => bail!("unknown command byte {other:#04x}"),
        }
    }
}
