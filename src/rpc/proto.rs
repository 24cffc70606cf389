//! Wire protocol: message types and frame codec.
//!
//! A frame is a little-endian `u32` length followed by the bincode
//! encoding of an [`Envelope`]. The length of any frame is capped at
//! `ESDM_RPC_MAX_MSG_SIZE`; oversized requests are rejected, clients chunk.

use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::defs::ESDM_RPC_MAX_MSG_SIZE;

/// Methods of the unprivileged service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnprivRequest {
    /// Human-readable daemon status.
    Status,
    /// Random bytes with whatever quality the DRNG has right now.
    GetRandomBytes { len: u32 },
    /// Random bytes, blocking until the ESDM is operational.
    GetRandomBytesFull { len: u32 },
    /// Random bytes, blocking until the ESDM is minimally seeded.
    GetRandomBytesMin { len: u32 },
    /// Currently available entropy in bits.
    GetEntLvl,
    /// Upper bound in seconds between two DRNG reseeds.
    GetMinReseedSecs,
    /// Uncredited data write into the auxiliary pool.
    WriteData { data: Vec<u8> },
    /// Entropy count of the auxiliary pool (RNDGETENTCNT).
    RndGetEntCnt,
}

/// Methods of the privileged service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrivRequest {
    /// Adjust the auxiliary pool entropy count (RNDADDTOENTCNT).
    RndAddToEntCnt { delta: i32 },
    /// Credited entropy insertion (RNDADDENTROPY).
    RndAddEntropy { data: Vec<u8>, entcnt: u32 },
    /// Drop all accounted entropy (RNDCLEARPOOL / RNDZAPENTCNT).
    RndClearPool,
    /// Force a reseed of all DRNGs (RNDRESEEDCRNG).
    RndReseedCrng,
}

/// Uniform response: `ret` carries the produced byte count or a scalar
/// result on success and a negated errno-style code on failure; `data`
/// carries the method payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub ret: i64,
    pub data: Vec<u8>,
}

impl Response {
    pub fn ok(ret: i64) -> Self {
        Self {
            ret,
            data: Vec::new(),
        }
    }

    pub fn error(e: crate::error::EsdmError) -> Self {
        Self {
            ret: e.wire_code(),
            data: Vec::new(),
        }
    }

    pub fn with_data(ret: i64, data: Vec<u8>) -> Self {
        Self { ret, data }
    }
}

/// One frame body: the call id pairs a response to its request even when
/// responses arrive out of order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub call_id: u64,
    pub msg: T,
}

/// Writes one frame. Fails without touching the stream when the encoded
/// message exceeds the frame limit.
pub fn write_msg<T: Serialize>(w: &mut impl Write, call_id: u64, msg: &T) -> io::Result<()> {
    let body = bincode::serialize(&Envelope { call_id, msg })
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if body.len() > ESDM_RPC_MAX_MSG_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "RPC message exceeds maximum size",
        ));
    }
    w.write_all(&(body.len() as u32).to_le_bytes())?;
    w.write_all(&body)?;
    w.flush()
}

/// Reads one frame, enforcing the frame limit before allocating.
pub fn read_msg<T: DeserializeOwned>(r: &mut impl Read) -> io::Result<Envelope<T>> {
    let mut len_bytes = [0u8; 4];
    r.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len == 0 || len > ESDM_RPC_MAX_MSG_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "RPC frame length out of bounds",
        ));
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body)?;
    bincode::deserialize(&body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_round_trip() {
        let mut buf = Vec::new();
        write_msg(&mut buf, 7, &UnprivRequest::GetRandomBytes { len: 32 }).unwrap();

        let env: Envelope<UnprivRequest> = read_msg(&mut buf.as_slice()).unwrap();
        assert_eq!(env.call_id, 7);
        assert_eq!(env.msg, UnprivRequest::GetRandomBytes { len: 32 });
    }

    #[test]
    fn test_oversized_frame_rejected_on_write() {
        let mut buf = Vec::new();
        let resp = Response::with_data(0, vec![0u8; ESDM_RPC_MAX_MSG_SIZE + 1]);
        assert!(write_msg(&mut buf, 1, &resp).is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_bogus_length_rejected_on_read() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(u32::MAX).to_le_bytes());
        buf.extend_from_slice(&[0u8; 16]);
        assert!(read_msg::<Response>(&mut buf.as_slice()).is_err());
    }

    #[test]
    fn test_priv_requests_round_trip() {
        let reqs = vec![
            PrivRequest::RndAddToEntCnt { delta: -12 },
            PrivRequest::RndAddEntropy {
                data: vec![0u8; 64],
                entcnt: 64,
            },
            PrivRequest::RndClearPool,
            PrivRequest::RndReseedCrng,
        ];
        for req in reqs {
            let mut buf = Vec::new();
            write_msg(&mut buf, 3, &req).unwrap();
            let env: Envelope<PrivRequest> = read_msg(&mut buf.as_slice()).unwrap();
            assert_eq!(env.msg, req);
        }
    }
}
