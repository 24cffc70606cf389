//! ESDM daemon.
//!
//! Initialises the daemon context, runs the seeding thread and both RPC
//! services, and publishes the status shared memory until terminated.
//! Termination signals only raise a flag; all teardown happens on the main
//! thread.

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use esdm::{Esdm, EsdmOpts};

/// Exit code understood by test harnesses as "skipped: requires root".
const EXIT_NEED_ROOT: i32 = 77;

static TERMINATED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_terminate(_sig: libc::c_int) {
    // Signal context: flag only, the main loop does the work.
    TERMINATED.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGTERM, on_terminate as libc::sighandler_t);
        libc::signal(libc::SIGINT, on_terminate as libc::sighandler_t);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn main() {
    env_logger::init();

    let testmode = std::env::var_os("ESDM_TESTMODE").is_some();

    // The sockets under /var/run and the privileged service need root.
    if unsafe { libc::geteuid() } != 0 {
        eprintln!("esdm-server must run as root");
        std::process::exit(EXIT_NEED_ROOT);
    }

    let opts = EsdmOpts {
        testmode,
        ..EsdmOpts::default()
    };

    let esdm = match Esdm::initialise(opts) {
        Ok(esdm) => esdm,
        Err(e) => {
            log::error!("ESDM initialisation failed: {}", e);
            std::process::exit(1);
        }
    };

    install_signal_handlers();

    let seeder = {
        let esdm = esdm.clone();
        std::thread::spawn(move || esdm.seed_worker_loop())
    };

    let (unpriv_srv, priv_srv) = match esdm.start_rpc_servers() {
        Ok(servers) => servers,
        Err(e) => {
            log::error!("cannot start RPC services: {}", e);
            esdm.shutdown();
            std::process::exit(1);
        }
    };

    log::info!("ESDM daemon {} running", esdm::version());

    // Refresh the published status periodically; the entropy level moves
    // without state transitions.
    let mut ticks = 0u32;
    while !TERMINATED.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(200));
        ticks += 1;
        if ticks % 50 == 0 {
            esdm.publish_status();
        }
    }

    log::info!("ESDM daemon terminating");
    esdm.shutdown();
    let _ = seeder.join();
    unpriv_srv.join();
    priv_srv.join();

    drop(esdm);
    std::process::exit(0);
}
