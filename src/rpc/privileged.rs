//! Privileged service handlers.
//!
//! Privilege separation happens at the socket: the privileged socket is
//! created root-only, so every request arriving here is already trusted
//! with the entropy accounting.

use std::sync::Arc;

use super::proto::{PrivRequest, Response};
use super::server::RpcService;
use super::ESDM_RPC_MAX_DATA;
use crate::error::EsdmError;
use crate::Esdm;

pub struct PrivService {
    esdm: Arc<Esdm>,
}

impl PrivService {
    pub fn new(esdm: Arc<Esdm>) -> Self {
        Self { esdm }
    }
}

impl RpcService for PrivService {
    type Request = PrivRequest;

    fn name(&self) -> &'static str {
        "privileged"
    }

    fn dispatch(&self, request: PrivRequest) -> Response {
        match request {
            PrivRequest::RndAddToEntCnt { delta } => {
                self.esdm.rnd_add_to_ent_cnt(delta);
                Response::ok(0)
            }
            PrivRequest::RndAddEntropy { data, entcnt } => {
                if data.is_empty() || data.len() > ESDM_RPC_MAX_DATA {
                    return Response::error(EsdmError::InvalidArgument);
                }
                match self.esdm.rnd_add_entropy(&data, entcnt) {
                    Ok(()) => Response::ok(0),
                    Err(e) => Response::error(e),
                }
            }
            PrivRequest::RndClearPool => {
                self.esdm.rnd_clear_pool();
                Response::ok(0)
            }
            PrivRequest::RndReseedCrng => {
                self.esdm.rnd_reseed_crng();
                Response::ok(0)
            }
        }
    }
}
