//! Status shared memory and change notification.
//!
//! The daemon publishes one versioned status record on a POSIX shared
//! memory segment and posts a named counting semaphore on every state
//! transition; clients block on the semaphore and re-read the record. The
//! segment is world-readable, writable only by the daemon.

use core::sync::atomic::{AtomicBool, Ordering};
use std::ffi::CString;

use crate::defs::ESDM_SHM_STATUS_VERSION;
use crate::error::EsdmError;

/// Size of the human-readable status string in the record.
pub const ESDM_SHM_INFO_SIZE: usize = 1024;

/// The record layout shared with foreign readers. Field order is ABI.
#[repr(C)]
pub struct ShmStatus {
    /// Monotonically increasing layout version.
    pub version: u32,
    /// Human-readable status string.
    pub info: [u8; ESDM_SHM_INFO_SIZE],
    pub infolen: usize,
    /// Number of threads handling the unprivileged interface.
    pub unpriv_threads: u32,
    /// Is the ESDM operational?
    pub operational: AtomicBool,
    /// Do we need new entropy?
    pub need_entropy: AtomicBool,
}

pub fn shm_name(testmode: bool) -> String {
    if testmode {
        "/esdm-testmode".to_string()
    } else {
        "/esdm".to_string()
    }
}

pub fn sem_name(testmode: bool) -> String {
    if testmode {
        "/esdm-shm-status-semaphore-testmode".to_string()
    } else {
        "/esdm-shm-status-semaphore".to_string()
    }
}

/// Daemon-side owner of the status segment and the semaphore.
pub struct StatusShm {
    status: *mut ShmStatus,
    sem: *mut libc::sem_t,
    shm_name: CString,
    sem_name: CString,
}

// The raw pointers target process-shared mappings; all mutation goes
// through atomics or the daemon's single status writer.
unsafe impl Send for StatusShm {}
unsafe impl Sync for StatusShm {}

impl StatusShm {
    pub fn create(testmode: bool, unpriv_threads: u32) -> Result<Self, EsdmError> {
        let shm_name = CString::new(shm_name(testmode)).map_err(|_| EsdmError::Fatal)?;
        let sem_name = CString::new(sem_name(testmode)).map_err(|_| EsdmError::Fatal)?;
        let size = core::mem::size_of::<ShmStatus>();

        let status = unsafe {
            let fd = libc::shm_open(
                shm_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR,
                0o644 as libc::mode_t,
            );
            if fd < 0 {
                log::error!("cannot create status shared memory segment");
                return Err(EsdmError::Fatal);
            }
            if libc::ftruncate(fd, size as libc::off_t) < 0 {
                libc::close(fd);
                return Err(EsdmError::Fatal);
            }
            let map = libc::mmap(
                core::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            );
            libc::close(fd);
            if map == libc::MAP_FAILED {
                return Err(EsdmError::Fatal);
            }
            map as *mut ShmStatus
        };

        let sem = unsafe {
            libc::sem_open(
                sem_name.as_ptr(),
                libc::O_CREAT,
                0o644 as libc::c_uint,
                0 as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            unsafe {
                libc::munmap(status as *mut libc::c_void, size);
            }
            log::error!("cannot create status semaphore");
            return Err(EsdmError::Fatal);
        }

        let shm = Self {
            status,
            sem,
            shm_name,
            sem_name,
        };
        unsafe {
            (*status).version = ESDM_SHM_STATUS_VERSION;
            (*status).unpriv_threads = unpriv_threads;
        }
        Ok(shm)
    }

    /// Rewrites the status record and posts the change semaphore.
    pub fn update(&self, info: &str, operational: bool, need_entropy: bool) {
        let bytes = info.as_bytes();
        let len = bytes.len().min(ESDM_SHM_INFO_SIZE - 1);
        unsafe {
            (&mut (*self.status).info)[..len].copy_from_slice(&bytes[..len]);
            (*self.status).info[len] = 0;
            (*self.status).infolen = len;
            (*self.status).operational.store(operational, Ordering::Relaxed);
            (*self.status)
                .need_entropy
                .store(need_entropy, Ordering::Relaxed);
            libc::sem_post(self.sem);
        }
    }

    /// Current info string, mainly for tests and the local status RPC.
    pub fn info(&self) -> String {
        unsafe {
            let len = (*self.status).infolen.min(ESDM_SHM_INFO_SIZE - 1);
            String::from_utf8_lossy(&(&(*self.status).info)[..len]).into_owned()
        }
    }

    pub fn operational(&self) -> bool {
        unsafe { (*self.status).operational.load(Ordering::Relaxed) }
    }

    pub fn need_entropy(&self) -> bool {
        unsafe { (*self.status).need_entropy.load(Ordering::Relaxed) }
    }

    /// Removes the names from the system. Called on daemon shutdown; the
    /// mapping itself is released on drop.
    pub fn unlink(&self) {
        unsafe {
            libc::shm_unlink(self.shm_name.as_ptr());
            libc::sem_unlink(self.sem_name.as_ptr());
        }
    }
}

impl Drop for StatusShm {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(
                self.status as *mut libc::c_void,
                core::mem::size_of::<ShmStatus>(),
            );
            libc::sem_close(self.sem);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_record_round_trip() {
        // Environments without a POSIX shm mount skip this test.
        let shm = match StatusShm::create(true, 4) {
            Ok(shm) => shm,
            Err(_) => return,
        };

        shm.update("ESDM operational", true, false);
        assert_eq!(shm.info(), "ESDM operational");
        assert!(shm.operational());
        assert!(!shm.need_entropy());

        shm.update("needs entropy", false, true);
        assert!(!shm.operational());
        assert!(shm.need_entropy());

        shm.unlink();
    }

    #[test]
    fn test_names_carry_testmode_suffix() {
        assert!(shm_name(true).contains("-testmode"));
        assert!(!shm_name(false).contains("-testmode"));
        assert!(sem_name(true).ends_with("-testmode"));
    }
}
