//! Framing of requests and result streams between nodes.
//!
//! A request is a one-byte opcode followed by a little-endian `u32` length and that many
//! payload bytes. Parameterized requests then carry any number of length-prefixed keys,
//! ended by `END_OF_KEYS`. Results come back as `|`-joined lines closed by the line `|`.

use bytes::Bytes;
use common::{DbError, Tuple, COL_DELIM, ROW_DELIM};
use std::io::{self, BufRead, ErrorKind, Read, Write};

use crate::opiterator::{OpIterator, Operator};

/// Key length that closes a parameterized session.
pub const END_OF_KEYS: u32 = u32::MAX;
/// Line ending a result stream.
pub const TERMINATOR: &[u8] = b"|\n";

/// Request kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Run a plan and stream its rows.
    Query,
    /// Run a correlated plan once per key.
    Param,
    /// Compute partition statistics.
    Stats,
    /// Run a plan and discard its rows.
    Fire,
}

impl Opcode {
    pub fn to_byte(self) -> u8 {
        match self {
            Opcode::Query => b'Q',
            Opcode::Param => b'P',
            Opcode::Stats => b'S',
            Opcode::Fire => b'F',
        }
    }

    pub fn from_byte(b: u8) -> Result<Self, DbError> {
        match b {
            b'Q' => Ok(Opcode::Query),
            b'P' => Ok(Opcode::Param),
            b'S' => Ok(Opcode::Stats),
            b'F' => Ok(Opcode::Fire),
            other => Err(DbError::ProtocolError(format!("unknown opcode {:#x}", other))),
        }
    }
}

/// One line of a result stream.
#[derive(Debug, PartialEq)]
pub enum Line {
    Row(Bytes),
    /// The terminator line.
    End,
    /// The peer went away.
    Closed,
}

/// True for errors meaning the peer closed or reset the stream.
pub fn is_peer_closed(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
    )
}

fn transport(e: io::Error) -> DbError {
    DbError::TransportError(e.to_string())
}

/// Writes an opcode with its length-prefixed payload.
pub fn write_request<W: Write>(w: &mut W, op: Opcode, payload: &[u8]) -> io::Result<()> {
    w.write_all(&[op.to_byte()])?;
    write_frame(w, payload)
}

/// Writes a little-endian `u32` length followed by the bytes.
pub fn write_frame<W: Write>(w: &mut W, payload: &[u8]) -> io::Result<()> {
    if payload.len() >= END_OF_KEYS as usize {
        return Err(io::Error::new(ErrorKind::InvalidInput, "frame too large"));
    }
    w.write_all(&(payload.len() as u32).to_le_bytes())?;
    w.write_all(payload)
}

pub fn write_end_of_keys<W: Write>(w: &mut W) -> io::Result<()> {
    w.write_all(&END_OF_KEYS.to_le_bytes())
}

/// Reads the next opcode. `None` when the peer closed the connection between requests.
pub fn read_opcode<R: Read>(r: &mut R) -> Result<Option<Opcode>, DbError> {
    let mut b = [0u8; 1];
    match r.read_exact(&mut b) {
        Ok(()) => Opcode::from_byte(b[0]).map(Some),
        Err(e) if is_peer_closed(&e) => Ok(None),
        Err(e) => Err(transport(e)),
    }
}

fn read_len<R: Read>(r: &mut R) -> Result<Option<u32>, DbError> {
    let mut len = [0u8; 4];
    match r.read_exact(&mut len) {
        Ok(()) => Ok(Some(u32::from_le_bytes(len))),
        Err(e) if is_peer_closed(&e) => Ok(None),
        Err(e) => Err(transport(e)),
    }
}

fn read_body<R: Read>(r: &mut R, len: u32) -> Result<Bytes, DbError> {
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).map_err(|e| {
        if is_peer_closed(&e) {
            DbError::ProtocolError(String::from("truncated frame"))
        } else {
            transport(e)
        }
    })?;
    Ok(Bytes::from(buf))
}

/// Reads a length-prefixed payload.
pub fn read_frame<R: Read>(r: &mut R) -> Result<Bytes, DbError> {
    match read_len(r)? {
        Some(len) if len != END_OF_KEYS => read_body(r, len),
        Some(_) => Err(DbError::ProtocolError(String::from("unexpected end of keys"))),
        None => Err(DbError::ProtocolError(String::from("missing frame"))),
    }
}

/// Reads the next key of a parameterized session. `None` once the session ends, either by
/// `END_OF_KEYS` or by the peer closing the connection.
pub fn read_key<R: Read>(r: &mut R) -> Result<Option<Bytes>, DbError> {
    match read_len(r)? {
        Some(len) if len != END_OF_KEYS => read_body(r, len).map(Some),
        _ => Ok(None),
    }
}

/// Reads one line of a result stream.
pub fn read_line<R: BufRead>(r: &mut R) -> Result<Line, DbError> {
    let mut buf = Vec::new();
    match r.read_until(ROW_DELIM, &mut buf) {
        Ok(0) => Ok(Line::Closed),
        Ok(_) => {
            if buf.last() != Some(&ROW_DELIM) {
                // Cut off mid-line.
                return Ok(Line::Closed);
            }
            buf.pop();
            if buf.len() == 1 && buf[0] == COL_DELIM {
                Ok(Line::End)
            } else {
                Ok(Line::Row(Bytes::from(buf)))
            }
        }
        Err(e) if is_peer_closed(&e) => Ok(Line::Closed),
        Err(e) => Err(transport(e)),
    }
}

/// Writes one result row.
pub fn write_row<W: Write>(w: &mut W, tuple: &Tuple) -> io::Result<()> {
    tuple.write_line(w)
}

/// Pulls every row of an opened operator onto `w`, then the terminator. Returns the
/// number of rows sent.
pub fn stream_results<W: Write>(op: &mut Operator, w: &mut W) -> Result<usize, DbError> {
    let mut count = 0;
    while let Some(tuple) = op.next()? {
        write_row(w, &tuple).map_err(transport)?;
        count += 1;
    }
    w.write_all(TERMINATOR).map_err(transport)?;
    w.flush().map_err(transport)?;
    Ok(count)
}
