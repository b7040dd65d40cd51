//! Length-framed snapshot encoding.
//!
//! A snapshot stream is a sequence of sections, each prefixed with its length
//! as a big-endian `u64`: `[len][registry][len][scheduler][len][user]`. The
//! framing lets readers skip sections they do not understand, which keeps the
//! format forward-compatible.

use std::io::Read;
use std::io::Write;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::SnapshotError;

pub(crate) fn write_section<W, T>(w: &mut W, value: &T) -> Result<(), SnapshotError>
where
    W: Write,
    T: Serialize,
{
    let body = bincode::serialize(value)?;
    write_raw_section(w, &body)
}

pub(crate) fn read_section<R, T>(r: &mut R) -> Result<T, SnapshotError>
where
    R: Read,
    T: DeserializeOwned,
{
    let body = read_raw_section(r)?;
    Ok(bincode::deserialize(&body)?)
}

pub(crate) fn write_raw_section<W: Write>(w: &mut W, body: &[u8]) -> Result<(), SnapshotError> {
    w.write_all(&(body.len() as u64).to_be_bytes())?;
    w.write_all(body)?;
    Ok(())
}

pub(crate) fn read_raw_section<R: Read>(r: &mut R) -> Result<Vec<u8>, SnapshotError> {
    let mut len = [0u8; 8];
    r.read_exact(&mut len)?;
    let mut body = vec![0u8; u64::from_be_bytes(len) as usize];
    r.read_exact(&mut body)?;
    Ok(body)
}
