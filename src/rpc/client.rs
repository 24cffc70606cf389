//! RPC client used by device frontends and tests.
//!
//! One client owns one connected stream. Responses are paired to requests
//! by call id; frames carrying a foreign id are discarded. Any transport
//! error surfaces as [`EsdmError::Transient`], matching the `-EINTR`
//! convention for disconnects.

use core::sync::atomic::{AtomicU64, Ordering};
use std::os::unix::net::UnixStream;
use std::path::Path;

use parking_lot::Mutex;
use serde::Serialize;

use super::proto::{read_msg, write_msg, Envelope, PrivRequest, Response, UnprivRequest};
use super::{priv_socket_path, unpriv_socket_path, ESDM_RPC_MAX_DATA};
use crate::error::EsdmError;

pub struct EsdmRpcClient {
    stream: Mutex<UnixStream>,
    next_call_id: AtomicU64,
}

impl EsdmRpcClient {
    pub fn connect(path: impl AsRef<Path>) -> Result<Self, EsdmError> {
        let stream = UnixStream::connect(path).map_err(|_| EsdmError::Transient)?;
        Ok(Self {
            stream: Mutex::new(stream),
            next_call_id: AtomicU64::new(1),
        })
    }

    pub fn connect_unpriv(testmode: bool) -> Result<Self, EsdmError> {
        Self::connect(unpriv_socket_path(testmode))
    }

    pub fn connect_priv(testmode: bool) -> Result<Self, EsdmError> {
        Self::connect(priv_socket_path(testmode))
    }

    fn call<R: Serialize>(&self, request: &R) -> Result<Response, EsdmError> {
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let mut stream = self.stream.lock();

        write_msg(&mut *stream, call_id, request).map_err(|_| EsdmError::Transient)?;
        loop {
            let envelope: Envelope<Response> =
                read_msg(&mut *stream).map_err(|_| EsdmError::Transient)?;
            if envelope.call_id == call_id {
                return Ok(envelope.msg);
            }
            // A response for an abandoned call; keep waiting for ours.
        }
    }

    fn checked(&self, response: Response) -> Result<Response, EsdmError> {
        if response.ret < 0 {
            Err(EsdmError::from_wire_code(response.ret).unwrap_or(EsdmError::Transient))
        } else {
            Ok(response)
        }
    }

    pub fn status(&self) -> Result<String, EsdmError> {
        let resp = self.checked(self.call(&UnprivRequest::Status)?)?;
        Ok(String::from_utf8_lossy(&resp.data).into_owned())
    }

    fn random_bytes(
        &self,
        len: usize,
        build: impl Fn(u32) -> UnprivRequest,
    ) -> Result<Vec<u8>, EsdmError> {
        let mut out = Vec::with_capacity(len);
        // The server emits one chunk per call; assemble larger requests
        // client-side.
        while out.len() < len {
            let todo = (len - out.len()).min(ESDM_RPC_MAX_DATA) as u32;
            let resp = self.checked(self.call(&build(todo))?)?;
            if resp.ret == 0 || resp.data.is_empty() {
                break;
            }
            out.extend_from_slice(&resp.data);
        }
        Ok(out)
    }

    pub fn get_random_bytes(&self, len: usize) -> Result<Vec<u8>, EsdmError> {
        self.random_bytes(len, |len| UnprivRequest::GetRandomBytes { len })
    }

    pub fn get_random_bytes_full(&self, len: usize) -> Result<Vec<u8>, EsdmError> {
        self.random_bytes(len, |len| UnprivRequest::GetRandomBytesFull { len })
    }

    pub fn get_random_bytes_min(&self, len: usize) -> Result<Vec<u8>, EsdmError> {
        self.random_bytes(len, |len| UnprivRequest::GetRandomBytesMin { len })
    }

    pub fn get_ent_lvl(&self) -> Result<u32, EsdmError> {
        let resp = self.checked(self.call(&UnprivRequest::GetEntLvl)?)?;
        Ok(resp.ret as u32)
    }

    pub fn get_min_reseed_secs(&self) -> Result<u64, EsdmError> {
        let resp = self.checked(self.call(&UnprivRequest::GetMinReseedSecs)?)?;
        Ok(resp.ret as u64)
    }

    pub fn write_data(&self, data: &[u8]) -> Result<(), EsdmError> {
        for chunk in data.chunks(ESDM_RPC_MAX_DATA) {
            self.checked(self.call(&UnprivRequest::WriteData {
                data: chunk.to_vec(),
            })?)?;
        }
        Ok(())
    }

    pub fn rnd_get_ent_cnt(&self) -> Result<u32, EsdmError> {
        let resp = self.checked(self.call(&UnprivRequest::RndGetEntCnt)?)?;
        Ok(resp.ret as u32)
    }

    pub fn rnd_add_to_ent_cnt(&self, delta: i32) -> Result<(), EsdmError> {
        self.checked(self.call(&PrivRequest::RndAddToEntCnt { delta })?)?;
        Ok(())
    }

    pub fn rnd_add_entropy(&self, data: &[u8], entcnt: u32) -> Result<(), EsdmError> {
        if data.is_empty() || data.len() > ESDM_RPC_MAX_DATA {
            return Err(EsdmError::InvalidArgument);
        }
        self.checked(self.call(&PrivRequest::RndAddEntropy {
            data: data.to_vec(),
            entcnt,
        })?)?;
        Ok(())
    }

    pub fn rnd_clear_pool(&self) -> Result<(), EsdmError> {
        self.checked(self.call(&PrivRequest::RndClearPool)?)?;
        Ok(())
    }

    pub fn rnd_reseed_crng(&self) -> Result<(), EsdmError> {
        self.checked(self.call(&PrivRequest::RndReseedCrng)?)?;
        Ok(())
    }
}
