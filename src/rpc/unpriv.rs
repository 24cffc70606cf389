//! Unprivileged service handlers.

use std::sync::Arc;

use zeroize::Zeroizing;

use super::proto::{Response, UnprivRequest};
use super::server::RpcService;
use super::ESDM_RPC_MAX_DATA;
use crate::error::EsdmError;
use crate::Esdm;

/// Blocking behaviour of the random-bytes variants.
enum WaitFor {
    Nothing,
    MinSeeded,
    Operational,
}

pub struct UnprivService {
    esdm: Arc<Esdm>,
}

impl UnprivService {
    pub fn new(esdm: Arc<Esdm>) -> Self {
        Self { esdm }
    }

    fn random_bytes(&self, len: u32, wait: WaitFor) -> Response {
        let len = len as usize;
        if len > ESDM_RPC_MAX_DATA {
            // One chunk per call; the client loops over larger requests.
            return Response::error(EsdmError::InvalidArgument);
        }

        match wait {
            WaitFor::Nothing => {}
            WaitFor::MinSeeded => self.esdm.state().sleep_while_non_min_seeded(),
            WaitFor::Operational => {
                if let Err(e) = self.esdm.state().sleep_while_nonoperational(false) {
                    return Response::error(e);
                }
            }
        }

        let mut buf = Zeroizing::new(vec![0u8; len]);
        match self.esdm.get_random_bytes(&mut buf) {
            Ok(n) => Response::with_data(n as i64, buf[..n].to_vec()),
            Err(e) => Response::error(e),
        }
    }
}

impl RpcService for UnprivService {
    type Request = UnprivRequest;

    fn name(&self) -> &'static str {
        "unprivileged"
    }

    fn dispatch(&self, request: UnprivRequest) -> Response {
        match request {
            UnprivRequest::Status => {
                Response::with_data(0, self.esdm.status_string().into_bytes())
            }
            UnprivRequest::GetRandomBytes { len } => self.random_bytes(len, WaitFor::Nothing),
            UnprivRequest::GetRandomBytesFull { len } => {
                self.random_bytes(len, WaitFor::Operational)
            }
            UnprivRequest::GetRandomBytesMin { len } => {
                self.random_bytes(len, WaitFor::MinSeeded)
            }
            UnprivRequest::GetEntLvl => Response::ok(self.esdm.avail_entropy_bits() as i64),
            UnprivRequest::GetMinReseedSecs => Response::ok(self.esdm.min_reseed_secs() as i64),
            UnprivRequest::WriteData { data } => {
                if data.is_empty() || data.len() > ESDM_RPC_MAX_DATA {
                    return Response::error(EsdmError::InvalidArgument);
                }
                self.esdm.write_data(&data);
                Response::ok(0)
            }
            UnprivRequest::RndGetEntCnt => Response::ok(self.esdm.rnd_get_ent_cnt() as i64),
        }
    }
}
