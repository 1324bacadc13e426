//! CPU affinity for worker threads.
//!
//! Workers pin themselves before touching their data structures, so
//! first-touch page placement lands on the local NUMA node. Pinning
//! failure is a warning, never fatal; the engine runs unpinned with worse
//! tail latency.

/// Errors from pinning a thread.
#[derive(Debug, thiserror::Error)]
pub enum AffinityError {
    /// The requested CPU does not exist on this host.
    #[error("cpu {cpu} out of range (0..{online})")]
    CpuOutOfRange {
        /// Requested CPU id.
        cpu: usize,
        /// Number of online CPUs.
        online: usize,
    },

    /// The kernel rejected the affinity mask.
    #[error("sched_setaffinity({cpu}) failed: {source}")]
    Syscall {
        /// Requested CPU id.
        cpu: usize,
        /// OS error.
        source: std::io::Error,
    },
}

/// Number of online CPUs.
#[must_use]
pub fn num_cores() -> usize {
    num_cpus::get()
}

/// Pins the calling thread to `cpu`.
///
/// # Errors
///
/// Returns an error if `cpu` is out of range or the kernel rejects the
/// mask. On non-Linux platforms this is a no-op that always succeeds.
pub fn pin_current_thread(cpu: usize) -> Result<(), AffinityError> {
    let online = num_cores();
    if cpu >= online {
        return Err(AffinityError::CpuOutOfRange { cpu, online });
    }

    #[cfg(target_os = "linux")]
    {
        use libc::{cpu_set_t, sched_setaffinity, CPU_SET, CPU_ZERO};

        // SAFETY: cpu_set_t is a plain bitmask initialized by CPU_ZERO;
        // pid 0 targets the calling thread.
        unsafe {
            let mut set: cpu_set_t = std::mem::zeroed();
            CPU_ZERO(&mut set);
            CPU_SET(cpu, &mut set);

            if sched_setaffinity(0, std::mem::size_of::<cpu_set_t>(), &set) != 0 {
                return Err(AffinityError::Syscall {
                    cpu,
                    source: std::io::Error::last_os_error(),
                });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_rejected() {
        let err = pin_current_thread(usize::MAX).unwrap_err();
        assert!(matches!(err, AffinityError::CpuOutOfRange { .. }));
    }

    #[test]
    fn test_pin_to_cpu_zero() {
        // CPU 0 exists everywhere; pinning the test thread is harmless.
        // Containerized runners may restrict the mask, so a syscall error
        // is tolerated; only panics are bugs here.
        let _ = pin_current_thread(0);
    }
}
