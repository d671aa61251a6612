//! Resource ceilings and usage sampling.
//!
//! `apply` installs native limits on the *current* process, so it is only
//! ever called inside the sandbox worker, once the interpreter is built. Both
//! ceilings are set on top of what the process already holds, so the budget
//! belongs to the script rather than to interpreter start-up. The in-process
//! strategy cannot limit the host and only watches CPU through a `UsageGuard`.

use python_sandbox::protocol::{ExecutionLimits, ResourceKind, ResourceUsageSample};

use crate::error::PlatformError;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Install memory and CPU ceilings on the current process
#[cfg(unix)]
pub fn apply(limits: &ExecutionLimits) -> Result<(), PlatformError> {
    if let Some(bytes) = limits.memory_limit_bytes() {
        let baseline = imp::address_space_bytes().unwrap_or(0);
        let ceiling = baseline.saturating_add(bytes);
        set_limit(libc::RLIMIT_AS, "setrlimit(RLIMIT_AS)", ceiling, ceiling)?;
        tracing::debug!(baseline, ceiling, "address space limit applied");
    }

    if let Some(cpu) = limits.cpu_time_limit() {
        let (soft, hard) = cpu_ceiling(cpu.as_secs(), sample().cpu_seconds);
        set_limit(libc::RLIMIT_CPU, "setrlimit(RLIMIT_CPU)", soft, hard)?;
        tracing::debug!(soft, hard, "cpu time limit applied");
    }

    Ok(())
}

/// RLIMIT_CPU counts the whole process, so the budget starts from the CPU
/// already used. The hard limit is one second later so SIGXCPU arrives
/// before SIGKILL.
#[cfg(unix)]
fn cpu_ceiling(budget_seconds: u64, used_seconds: f64) -> (u64, u64) {
    let soft = budget_seconds.saturating_add(used_seconds.ceil() as u64);
    (soft, soft.saturating_add(1))
}

#[cfg(not(unix))]
pub fn apply(_limits: &ExecutionLimits) -> Result<(), PlatformError> {
    Err(PlatformError::Unsupported {
        primitive: "setrlimit",
    })
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
type Resource = libc::__rlimit_resource_t;
#[cfg(all(unix, not(all(target_os = "linux", target_env = "gnu"))))]
type Resource = libc::c_int;

#[cfg(unix)]
fn set_limit(resource: Resource, call: &'static str, soft: u64, hard: u64) -> Result<(), PlatformError> {
    let mut current = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `current` is a valid, writable rlimit for the duration of the call
    if unsafe { libc::getrlimit(resource, &mut current) } != 0 {
        return Err(PlatformError::Syscall {
            call: "getrlimit",
            source: std::io::Error::last_os_error(),
        });
    }

    // An unprivileged process can lower its hard limit but never raise it
    let ceiling = current.rlim_max;
    let wanted = libc::rlimit {
        rlim_cur: (soft as libc::rlim_t).min(ceiling),
        rlim_max: (hard as libc::rlim_t).min(ceiling),
    };

    // SAFETY: `wanted` is a valid rlimit that outlives the call
    if unsafe { libc::setrlimit(resource, &wanted) } != 0 {
        return Err(PlatformError::Syscall {
            call,
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// Current memory and CPU usage of this process; zeros when unavailable
pub fn sample() -> ResourceUsageSample {
    imp::sample().unwrap_or_default()
}

#[cfg(unix)]
mod imp {
    use super::BYTES_PER_MB;
    use python_sandbox::protocol::ResourceUsageSample;

    fn rusage() -> Option<libc::rusage> {
        // SAFETY: rusage is plain old data; all-zero is a valid bit pattern
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        // SAFETY: `usage` is valid and writable for the duration of the call
        let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
        (rc == 0).then_some(usage)
    }

    fn seconds(tv: libc::timeval) -> f64 {
        tv.tv_sec as f64 + tv.tv_usec as f64 / 1_000_000.0
    }

    #[cfg(target_os = "linux")]
    fn resident_bytes(_usage: &libc::rusage) -> Option<u64> {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        // SAFETY: sysconf has no memory-safety preconditions
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        (page_size > 0).then(|| pages * page_size as u64)
    }

    // Peak rather than current, but the best getrusage offers
    #[cfg(target_os = "macos")]
    fn resident_bytes(usage: &libc::rusage) -> Option<u64> {
        Some(usage.ru_maxrss as u64)
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    fn resident_bytes(usage: &libc::rusage) -> Option<u64> {
        Some(usage.ru_maxrss as u64 * 1024)
    }

    pub fn sample() -> Option<ResourceUsageSample> {
        let usage = rusage()?;
        let memory = resident_bytes(&usage).unwrap_or(0);
        Some(ResourceUsageSample {
            memory_mb: memory as f64 / BYTES_PER_MB,
            cpu_seconds: seconds(usage.ru_utime) + seconds(usage.ru_stime),
        })
    }

    pub fn supported() -> bool {
        rusage().is_some()
    }

    /// Mapped address space, the quantity RLIMIT_AS caps
    #[cfg(target_os = "linux")]
    pub fn address_space_bytes() -> Option<u64> {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let pages: u64 = statm.split_whitespace().next()?.parse().ok()?;
        // SAFETY: sysconf has no memory-safety preconditions
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        (page_size > 0).then(|| pages * page_size as u64)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn address_space_bytes() -> Option<u64> {
        None
    }
}

#[cfg(not(unix))]
mod imp {
    use python_sandbox::protocol::ResourceUsageSample;

    pub fn sample() -> Option<ResourceUsageSample> {
        None
    }

    pub fn supported() -> bool {
        false
    }
}

/// Usage watcher for executions that share the host process.
///
/// Measures growth relative to the moment it was armed, so usage the host
/// already had is not charged to the script. Only the CPU budget is policed;
/// memory cannot be capped in a shared address space and is reported only.
#[derive(Debug, Clone)]
pub struct UsageGuard {
    baseline: ResourceUsageSample,
    limits: ExecutionLimits,
}

impl UsageGuard {
    pub fn arm(limits: &ExecutionLimits) -> Result<Self, PlatformError> {
        if !imp::supported() {
            return Err(PlatformError::Unsupported {
                primitive: "getrusage",
            });
        }
        Ok(Self {
            baseline: sample(),
            limits: *limits,
        })
    }

    /// Usage since the guard was armed
    pub fn usage(&self) -> ResourceUsageSample {
        let now = sample();
        ResourceUsageSample {
            memory_mb: (now.memory_mb - self.baseline.memory_mb).max(0.0),
            cpu_seconds: (now.cpu_seconds - self.baseline.cpu_seconds).max(0.0),
        }
    }

    /// The ceiling the execution has crossed, if any
    pub fn exceeded(&self) -> Option<ResourceKind> {
        let cpu = self.limits.cpu_time_limit_seconds;
        (cpu > 0 && self.usage().cpu_seconds > cpu as f64).then_some(ResourceKind::CpuTime)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_sample_reports_live_process() {
        let usage = sample();
        assert!(usage.memory_mb > 0.0);
        assert!(usage.cpu_seconds >= 0.0);
    }

    #[test]
    fn test_cpu_ceiling_starts_from_time_already_used() {
        assert_eq!(cpu_ceiling(1, 0.0), (1, 2));
        assert_eq!(cpu_ceiling(60, 0.4), (61, 62));
    }

    #[test]
    fn test_cpu_ceiling_saturates() {
        assert_eq!(cpu_ceiling(u64::MAX, 0.0), (u64::MAX, u64::MAX));
        assert_eq!(cpu_ceiling(u64::MAX, 3.2), (u64::MAX, u64::MAX));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_address_space_covers_resident_memory() {
        let mapped = imp::address_space_bytes().unwrap() as f64 / BYTES_PER_MB;
        assert!(mapped >= sample().memory_mb);
    }

    #[test]
    fn test_guard_within_limits() {
        let guard = UsageGuard::arm(&ExecutionLimits::default()).unwrap();
        assert_eq!(guard.exceeded(), None);
    }

    #[test]
    fn test_guard_with_disabled_ceilings_never_trips() {
        let limits = ExecutionLimits {
            timeout_seconds: 1,
            memory_limit_mb: 0,
            cpu_time_limit_seconds: 0,
        };
        let guard = UsageGuard::arm(&limits).unwrap();

        // burn a little CPU so the delta is non-zero
        let mut acc = 0u64;
        for i in 0..2_000_000u64 {
            acc = acc.wrapping_add(i * i);
        }
        assert!(acc > 0);
        assert_eq!(guard.exceeded(), None);
    }
}
