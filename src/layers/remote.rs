//! Remote terminal layer: a blocking loopback protocol stub.
//!
//! Ships a fixed-size request header (op code, descriptor, offset, length,
//! flags, mode, padded path) over a TCP connection and reads a fixed-size
//! reply (return value, errno), followed by payload bytes for reads and a
//! packed stat for the stat calls. One request is in flight at a time.
//!
//! This is a placeholder for interface completeness, not a transport: no
//! reconnects, no timeouts, no framing negotiation.

use std::io::{Read, Write};
use std::net::TcpStream;

use anyhow::Context;
use parking_lot::Mutex;

use crate::error::{LayerError, Result};
use crate::layer::{Fd, FileStat, Layer, OpContext, OpenFlags};

/// Loopback endpoint the `remote` layer type connects to.
pub const DEFAULT_ENDPOINT: &str = "127.0.0.1:8647";

/// Path field width in the wire header.
const PATH_CAP: usize = 256;

/// op(1) + fd(4) + offset(8) + len(8) + flags(4) + mode(4) + path(256).
const HEADER_LEN: usize = 29 + PATH_CAP;

/// ret(8) + errno(4).
const REPLY_LEN: usize = 12;

/// dev(8) + ino(8) + mode(4) + size(8) + mtime(8).
const STAT_LEN: usize = 36;

mod op {
    pub const OPEN: u8 = 1;
    pub const CLOSE: u8 = 2;
    pub const PREAD: u8 = 3;
    pub const PWRITE: u8 = 4;
    pub const FTRUNCATE: u8 = 5;
    pub const FSTAT: u8 = 6;
    pub const LSTAT: u8 = 7;
    pub const UNLINK: u8 = 8;
}

struct Request<'a> {
    op: u8,
    fd: Fd,
    offset: u64,
    len: u64,
    flags: u32,
    mode: u32,
    path: &'a str,
}

impl Request<'_> {
    fn encode(&self) -> Result<[u8; HEADER_LEN]> {
        if self.path.len() > PATH_CAP {
            return Err(LayerError::InvalidArgument("path too long for remote header"));
        }
        let mut header = [0u8; HEADER_LEN];
        header[0] = self.op;
        header[1..5].copy_from_slice(&self.fd.to_le_bytes());
        header[5..13].copy_from_slice(&self.offset.to_le_bytes());
        header[13..21].copy_from_slice(&self.len.to_le_bytes());
        header[21..25].copy_from_slice(&self.flags.to_le_bytes());
        header[25..29].copy_from_slice(&self.mode.to_le_bytes());
        header[29..29 + self.path.len()].copy_from_slice(self.path.as_bytes());
        Ok(header)
    }
}

fn encode_flags(flags: OpenFlags) -> u32 {
    u32::from(flags.read)
        | u32::from(flags.write) << 1
        | u32::from(flags.create) << 2
        | u32::from(flags.truncate) << 3
}

/// Terminal layer speaking the loopback stub protocol.
pub struct RemoteLayer {
    stream: Mutex<TcpStream>,
}

impl RemoteLayer {
    /// Connects to the stub endpoint; failure aborts construction.
    pub fn connect(endpoint: &str) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(endpoint)
            .with_context(|| format!("remote: cannot reach stub at {endpoint}"))?;
        stream.set_nodelay(true).ok();
        Ok(Self { stream: Mutex::new(stream) })
    }

    /// Sends one request and reads the fixed reply, plus `extra` bytes of
    /// trailing payload on success.
    fn call(&self, request: &Request, body: Option<&[u8]>, extra: usize) -> Result<(i64, Vec<u8>)> {
        let header = request.encode()?;
        let mut stream = self.stream.lock();
        stream.write_all(&header)?;
        if let Some(body) = body {
            stream.write_all(body)?;
        }

        let mut reply = [0u8; REPLY_LEN];
        stream.read_exact(&mut reply)?;
        let ret = i64::from_le_bytes(reply[..8].try_into().unwrap());
        let errno = i32::from_le_bytes(reply[8..].try_into().unwrap());
        if ret < 0 {
            return Err(LayerError::from_errno(errno));
        }

        let trailing = match request.op {
            op::PREAD => ret as usize,
            _ => extra,
        };
        let mut payload = vec![0u8; trailing];
        stream.read_exact(&mut payload)?;
        Ok((ret, payload))
    }

    fn simple(&self, op: u8, fd: Fd, offset: u64, len: u64, path: &str) -> Result<(i64, Vec<u8>)> {
        let request = Request { op, fd, offset, len, flags: 0, mode: 0, path };
        self.call(&request, None, 0)
    }
}

fn decode_stat(raw: &[u8]) -> FileStat {
    FileStat {
        dev: u64::from_le_bytes(raw[0..8].try_into().unwrap()),
        ino: u64::from_le_bytes(raw[8..16].try_into().unwrap()),
        mode: u32::from_le_bytes(raw[16..20].try_into().unwrap()),
        size: u64::from_le_bytes(raw[20..28].try_into().unwrap()),
        mtime: i64::from_le_bytes(raw[28..36].try_into().unwrap()),
    }
}

impl Layer for RemoteLayer {
    fn kind(&self) -> &'static str {
        "remote"
    }

    fn open(&self, path: &str, flags: OpenFlags, mode: u32, _ctx: &OpContext) -> Result<Fd> {
        let request = Request {
            op: op::OPEN,
            fd: -1,
            offset: 0,
            len: 0,
            flags: encode_flags(flags),
            mode,
            path,
        };
        let (ret, _) = self.call(&request, None, 0)?;
        Ok(ret as Fd)
    }

    fn close(&self, fd: Fd, _ctx: &OpContext) -> Result<()> {
        self.simple(op::CLOSE, fd, 0, 0, "").map(drop)
    }

    fn pread(&self, fd: Fd, buf: &mut [u8], offset: u64, _ctx: &OpContext) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let (ret, payload) = self.simple(op::PREAD, fd, offset, buf.len() as u64, "")?;
        buf[..payload.len()].copy_from_slice(&payload);
        Ok(ret as usize)
    }

    fn pwrite(&self, fd: Fd, buf: &[u8], offset: u64, _ctx: &OpContext) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let request = Request {
            op: op::PWRITE,
            fd,
            offset,
            len: buf.len() as u64,
            flags: 0,
            mode: 0,
            path: "",
        };
        let (ret, _) = self.call(&request, Some(buf), 0)?;
        Ok(ret as usize)
    }

    fn ftruncate(&self, fd: Fd, length: u64, _ctx: &OpContext) -> Result<()> {
        self.simple(op::FTRUNCATE, fd, 0, length, "").map(drop)
    }

    fn fstat(&self, fd: Fd, _ctx: &OpContext) -> Result<FileStat> {
        let request = Request { op: op::FSTAT, fd, offset: 0, len: 0, flags: 0, mode: 0, path: "" };
        let (_, payload) = self.call(&request, None, STAT_LEN)?;
        Ok(decode_stat(&payload))
    }

    fn lstat(&self, path: &str, _ctx: &OpContext) -> Result<FileStat> {
        let request =
            Request { op: op::LSTAT, fd: -1, offset: 0, len: 0, flags: 0, mode: 0, path };
        let (_, payload) = self.call(&request, None, STAT_LEN)?;
        Ok(decode_stat(&payload))
    }

    fn unlink(&self, path: &str, _ctx: &OpContext) -> Result<()> {
        self.simple(op::UNLINK, -1, 0, 0, path).map(drop)
    }
}
