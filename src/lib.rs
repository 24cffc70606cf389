//! Entropy Source and DRNG Manager (ESDM).
//!
//! A user-space replacement for the operating system random number
//! generator: entropy from multiple independent noise sources is accounted
//! conservatively, compressed into seed buffers and injected into a pool of
//! deterministic random bit generators, which serve random numbers to
//! unprivileged and privileged callers over an RPC boundary.
//!
//! # Architecture
//! - [`es`] polls the noise sources and performs the entropy accounting.
//! - [`drng`] manages the DRNG instances and the seeding scheduler.
//! - [`state`] tracks the seeding progress and gates blocking readers.
//! - [`rpc`] exposes the privileged and unprivileged socket services.
//! - [`shm`] publishes the status record and the change semaphore.
//!
//! All shared daemon state lives in one [`Esdm`] context created by
//! [`Esdm::initialise`].

pub mod config;
pub mod crypto;
pub mod defs;
pub mod drng;
pub mod error;
pub mod es;
pub mod rpc;
pub mod shm;
pub mod state;

use core::sync::atomic::{AtomicBool, Ordering};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config, ForceFips};
use defs::*;
use drng::mgr::DrngMgr;
use error::EsdmError;
use es::mgr::EsMgr;
use rpc::server::RpcServer;
use shm::StatusShm;
use state::{EsdmState, StateMachine};

/// Creation options for the daemon context.
pub struct EsdmOpts {
    /// Append `-testmode` to socket, shared memory and semaphore names and
    /// unlock the test-only config setters.
    pub testmode: bool,
    /// Publish the status shared memory segment.
    pub status_shm: bool,
    /// Worker threads per RPC service, also advertised in the status
    /// record.
    pub unpriv_threads: u32,
}

impl Default for EsdmOpts {
    fn default() -> Self {
        Self {
            testmode: false,
            status_shm: true,
            unpriv_threads: 4,
        }
    }
}

/// The process-wide daemon context.
pub struct Esdm {
    config: Arc<Config>,
    state: Arc<StateMachine>,
    es: Arc<EsMgr>,
    drng: Arc<DrngMgr>,
    shm: Option<Arc<StatusShm>>,
    shutdown: Arc<AtomicBool>,
    unpriv_threads: u32,
}

fn render_status(
    state: EsdmState,
    es: &EsMgr,
    drng: &DrngMgr,
    config: &Config,
) -> String {
    let mut s = String::with_capacity(512);
    s.push_str(&format!("ESDM {}\n", version()));
    s.push_str(&format!(
        "state: {:?} (available: {})\n",
        state,
        drng.available()
    ));
    s.push_str(&format!(
        "SP800-90C compliance: {}\n",
        sp80090c_compliant(config)
    ));
    s.push_str(&format!(
        "entropy level: {} bits (threshold {} bits)\n",
        es.avail_entropy_bits(config),
        es.entropy_thresh()
    ));
    s.push_str(&drng.status_summary());
    s.push('\n');
    for source in es.sources() {
        s.push_str(&format!(
            "source {}: rate {} bits\n",
            source.name(),
            source.rate_bits(config)
        ));
    }
    s.push_str(&format!("aux pool entropy: {} bits\n", es.aux().ent_cnt()));
    s.push_str(&format!(
        "FIPS mode: {}\n",
        if config.fips_enabled() { "enabled" } else { "disabled" }
    ));
    s
}

/// Crate version string.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// SP 800-90C compliance: oversampling compiled in and FIPS mode active.
pub fn sp80090c_compliant(config: &Config) -> bool {
    ESDM_OVERSAMPLE_ENTROPY_SOURCES && config.fips_enabled()
}

impl Esdm {
    /// Creates the daemon context: configuration, entropy sources, DRNG
    /// manager (including crypto selftests) and optionally the status
    /// shared memory. Selftest failure is fatal and leaves the manager
    /// unavailable.
    pub fn initialise(opts: EsdmOpts) -> Result<Arc<Self>, EsdmError> {
        let config = Arc::new(Config::new(opts.testmode));
        let state = Arc::new(StateMachine::new());
        let es = Arc::new(EsMgr::new());
        let drng = Arc::new(DrngMgr::new());

        drng.initialize(&state)?;

        let shm = if opts.status_shm {
            match StatusShm::create(opts.testmode, opts.unpriv_threads) {
                Ok(shm) => Some(Arc::new(shm)),
                Err(e) => {
                    log::warn!("status shared memory unavailable: {}", e);
                    None
                }
            }
        } else {
            None
        };

        // Publish the status record on every state transition; the hook
        // runs outside the state lock.
        if let Some(shm) = shm.clone() {
            let hook_es = es.clone();
            let hook_drng = drng.clone();
            let hook_config = config.clone();
            state.set_transition_hook(Box::new(move |new_state| {
                shm.update(
                    &render_status(new_state, &hook_es, &hook_drng, &hook_config),
                    new_state == EsdmState::Operational,
                    hook_es.need_entropy(&hook_config),
                );
            }));
        }

        let esdm = Arc::new(Self {
            config,
            state,
            es,
            drng,
            shm,
            shutdown: Arc::new(AtomicBool::new(false)),
            unpriv_threads: opts.unpriv_threads,
        });
        esdm.publish_status();
        Ok(esdm)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> &StateMachine {
        &self.state
    }

    pub fn testmode(&self) -> bool {
        self.config.testmode()
    }

    pub fn status_string(&self) -> String {
        render_status(self.state.state(), &self.es, &self.drng, &self.config)
    }

    /// Rewrites the status record without a state transition (periodic
    /// refresh, entropy level changes).
    pub fn publish_status(&self) {
        if let Some(shm) = &self.shm {
            shm.update(
                &self.status_string(),
                self.state.is_operational(),
                self.es.need_entropy(&self.config),
            );
        }
    }

    /// Random bytes with whatever quality the DRNG currently has.
    pub fn get_random_bytes(&self, out: &mut [u8]) -> Result<usize, EsdmError> {
        self.drng.get(out, &self.es, &self.state, &self.config)
    }

    /// Random bytes after the ESDM reached the minimally-seeded state.
    pub fn get_random_bytes_min(&self, out: &mut [u8]) -> Result<usize, EsdmError> {
        self.state.sleep_while_non_min_seeded();
        self.get_random_bytes(out)
    }

    /// Random bytes after the ESDM became operational.
    pub fn get_random_bytes_full(&self, out: &mut [u8]) -> Result<usize, EsdmError> {
        self.state.sleep_while_nonoperational(false)?;
        self.get_random_bytes(out)
    }

    pub fn avail_entropy_bits(&self) -> u32 {
        self.es.avail_entropy_bits(&self.config)
    }

    pub fn min_reseed_secs(&self) -> u64 {
        self.drng.min_reseed_secs()
    }

    /// Uncredited data insertion into the auxiliary pool.
    pub fn write_data(&self, data: &[u8]) {
        self.es.aux().write_data(data, &self.config);
        self.es.wake_seeder();
    }

    pub fn rnd_get_ent_cnt(&self) -> u32 {
        self.es.aux().ent_cnt()
    }

    pub fn rnd_add_to_ent_cnt(&self, delta: i32) {
        self.es.aux().add_to_ent_cnt(delta);
        self.es.wake_seeder();
    }

    /// Credited entropy insertion. In FIPS mode the data is mixed in but
    /// no entropy is credited.
    pub fn rnd_add_entropy(&self, data: &[u8], entcnt_bits: u32) -> Result<(), EsdmError> {
        use es::EntropySource;
        self.es
            .aux()
            .add_entropy(data, entcnt_bits, &self.config)
            .map_err(|_| EsdmError::InvalidArgument)?;
        self.es.wake_seeder();
        Ok(())
    }

    pub fn rnd_clear_pool(&self) {
        self.es.aux().clear();
        self.publish_status();
    }

    /// Forces every DRNG to reseed before its next generate operation.
    pub fn rnd_reseed_crng(&self) {
        self.drng.force_reseed();
        self.es.wake_seeder();
    }

    /// Resets the DRNGs and the state machine; all accounted entropy is
    /// considered gone.
    pub fn reset(&self) {
        self.drng.reset(&self.es, &self.state);
        self.es.wake_seeder();
    }

    /// Runtime retuning wrappers: each store schedules a seeding wake-up.
    pub fn set_cpu_entropy_rate(&self, bits: u32) {
        self.config.set_cpu_entropy_rate(bits);
        self.es.wake_seeder();
    }

    pub fn set_jent_entropy_rate(&self, bits: u32) {
        self.config.set_jent_entropy_rate(bits);
        self.es.wake_seeder();
    }

    pub fn set_krng_entropy_rate(&self, bits: u32) {
        self.config.set_krng_entropy_rate(bits);
        self.es.wake_seeder();
    }

    pub fn set_sched_entropy_rate(&self, bits: u32) {
        self.config.set_sched_entropy_rate(bits);
        self.es.wake_seeder();
    }

    pub fn set_force_fips(&self, val: ForceFips) {
        self.config.set_force_fips(val);
        self.es.wake_seeder();
    }

    /// The seeding thread body: runs seeding rounds whenever woken or due,
    /// until shutdown.
    pub fn seed_worker_loop(&self) {
        self.drng.ensure_node_array(&self.config);
        while !self.shutdown.load(Ordering::Relaxed) {
            if self
                .es
                .reseed_wanted(self.state.all_nodes_seeded(), &self.config)
                || self.drng.init_instance().force_reseed()
            {
                if !self.drng.try_seed_work(&self.es, &self.state, &self.config) {
                    log::debug!("seeding already in flight, deferring");
                }
                self.publish_status();
            }
            self.es.wait_seeder(Duration::from_secs(1));
        }
    }

    /// Starts both RPC services on the standard socket paths with the
    /// configured worker-pool size.
    pub fn start_rpc_servers(self: &Arc<Self>) -> std::io::Result<(RpcServer, RpcServer)> {
        self.start_rpc_servers_at(
            Path::new(&rpc::unpriv_socket_path(self.testmode())),
            Path::new(&rpc::priv_socket_path(self.testmode())),
            self.unpriv_threads as usize,
        )
    }

    /// Starts both RPC services on explicit socket paths (tests).
    pub fn start_rpc_servers_at(
        self: &Arc<Self>,
        unpriv_path: &Path,
        priv_path: &Path,
        workers: usize,
    ) -> std::io::Result<(RpcServer, RpcServer)> {
        let unpriv = RpcServer::start(
            unpriv_path,
            rpc::UNPRIV_SOCKET_MODE,
            workers,
            Arc::new(rpc::unpriv::UnprivService::new(self.clone())),
            self.shutdown.clone(),
        )?;
        let privileged = RpcServer::start(
            priv_path,
            rpc::PRIV_SOCKET_MODE,
            workers,
            Arc::new(rpc::privileged::PrivService::new(self.clone())),
            self.shutdown.clone(),
        )?;
        Ok((unpriv, privileged))
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Initiates shutdown: raises the flag, releases the seeding thread
    /// and detaches the status segment.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.es.wake_seeder();
        if let Some(shm) = &self.shm {
            shm.unlink();
        }
        self.drng.finalize();
    }
}

/// `rand_core` adapter over the blocking output interface.
///
/// # Panics
///
/// The infallible `RngCore` methods panic when the ESDM cannot deliver;
/// a random-number service that cannot produce random numbers has no safe
/// continuation. Use `try_fill_bytes` for a fallible path.
pub struct EsdmRng<'a>(pub &'a Esdm);

impl rand_core::RngCore for EsdmRng<'_> {
    fn next_u32(&mut self) -> u32 {
        let mut buf = [0u8; 4];
        self.fill_bytes(&mut buf);
        u32::from_le_bytes(buf)
    }

    fn next_u64(&mut self) -> u64 {
        let mut buf = [0u8; 8];
        self.fill_bytes(&mut buf);
        u64::from_le_bytes(buf)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.0
            .get_random_bytes(dest)
            .expect("ESDM cannot deliver random bytes");
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.0
            .get_random_bytes(dest)
            .map(|_| ())
            .map_err(|e| rand_core::Error::new(e))
    }
}

impl rand_core::CryptoRng for EsdmRng<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::client::EsdmRpcClient;

    fn test_context() -> Arc<Esdm> {
        let esdm = Esdm::initialise(EsdmOpts {
            testmode: true,
            status_shm: false,
            unpriv_threads: 2,
        })
        .unwrap();
        esdm.set_force_fips(ForceFips::Disabled);
        esdm
    }

    fn seed_fully(esdm: &Esdm) {
        while !esdm.state().all_nodes_seeded() {
            esdm.drng.try_seed_work(&esdm.es, &esdm.state, &esdm.config);
        }
    }

    #[test]
    fn test_initialise_and_direct_output() {
        let esdm = test_context();
        let mut buf = [0u8; 64];
        assert_eq!(esdm.get_random_bytes(&mut buf), Ok(64));
        assert!(buf.iter().any(|&b| b != 0));
    }

    #[test]
    fn test_full_output_blocks_until_operational() {
        let esdm = test_context();
        assert_eq!(
            esdm.state().sleep_while_nonoperational(true),
            Err(EsdmError::WouldBlock)
        );

        let waiter = {
            let esdm = esdm.clone();
            std::thread::spawn(move || {
                let mut buf = [0u8; 32];
                esdm.get_random_bytes_full(&mut buf).unwrap();
                buf
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        seed_fully(&esdm);

        let buf = waiter.join().unwrap();
        assert!(esdm.state().is_operational());
        assert!(buf.iter().any(|&b| b != 0));
    }

    #[test]
    fn test_min_output_blocks_until_min_seeded() {
        let esdm = test_context();

        let waiter = {
            let esdm = esdm.clone();
            std::thread::spawn(move || {
                let mut buf = [0u8; 32];
                esdm.get_random_bytes_min(&mut buf).unwrap();
                esdm.state().is_min_seeded()
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        seed_fully(&esdm);

        // The waiter only ran after the machine left Uninitialised.
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_status_string_mentions_state_and_sources() {
        let esdm = test_context();
        let status = esdm.status_string();
        assert!(status.contains("state:"));
        assert!(status.contains("KernelRNG"));
        assert!(status.contains("FIPS mode: disabled"));
    }

    #[test]
    fn test_rng_core_adapter() {
        use rand_core::RngCore;

        let esdm = test_context();
        seed_fully(&esdm);
        let mut rng = EsdmRng(&esdm);
        let a = rng.next_u64();
        let b = rng.next_u64();
        assert_ne!(a, b);

        let mut buf = [0u8; 33];
        rng.try_fill_bytes(&mut buf).unwrap();
        assert!(buf.iter().any(|&x| x != 0));
    }

    #[test]
    fn test_rpc_end_to_end() {
        let esdm = test_context();
        seed_fully(&esdm);

        let dir = std::env::temp_dir().join(format!("esdm-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let unpriv = dir.join("unpriv.socket");
        let privileged = dir.join("priv.socket");

        let (unpriv_srv, priv_srv) = esdm
            .start_rpc_servers_at(&unpriv, &privileged, 2)
            .unwrap();

        let client = EsdmRpcClient::connect(&unpriv).unwrap();
        let bytes = client.get_random_bytes(128).unwrap();
        assert_eq!(bytes.len(), 128);
        assert!(bytes.iter().any(|&b| b != 0));

        let status = client.status().unwrap();
        assert!(status.contains("ESDM"));
        assert!(client.get_min_reseed_secs().unwrap() >= 1);

        let priv_client = EsdmRpcClient::connect(&privileged).unwrap();
        priv_client.rnd_add_entropy(&[0u8; 64], 64).unwrap();
        assert_eq!(client.rnd_get_ent_cnt().unwrap(), 64);
        priv_client.rnd_clear_pool().unwrap();
        assert_eq!(client.rnd_get_ent_cnt().unwrap(), 0);
        priv_client.rnd_reseed_crng().unwrap();

        esdm.shutdown();
        unpriv_srv.join();
        priv_srv.join();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_reset_returns_to_uninitialised() {
        let esdm = test_context();
        seed_fully(&esdm);
        assert!(esdm.state().is_operational());

        esdm.reset();
        assert_eq!(esdm.state().state(), EsdmState::Uninitialised);
        // Output still flows; quality is rebuilt by the next seeding.
        let mut buf = [0u8; 16];
        assert_eq!(esdm.get_random_bytes(&mut buf), Ok(16));
    }

    #[test]
    fn test_write_back_scenario() {
        let esdm = test_context();
        esdm.rnd_add_entropy(&[0u8; 64], 64).unwrap();
        assert_eq!(esdm.rnd_get_ent_cnt(), 64);

        esdm.set_force_fips(ForceFips::Enabled);
        esdm.rnd_clear_pool();
        esdm.rnd_add_entropy(&[0u8; 64], 64).unwrap();
        assert_eq!(esdm.rnd_get_ent_cnt(), 0);
    }
}
