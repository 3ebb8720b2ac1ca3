// src/runtime/resource_limiter.rs
//! Per-worker resource limits
//!
//! Limits are applied inside the worker process, after it starts and before
//! it reports ready, so a runaway line can only take down its own worker:
//! - Address space (MB), a failed allocation aborts the worker
//! - CPU time (seconds), the kernel sends SIGXCPU then SIGKILL

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerLimits {
    /// Address-space cap in megabytes
    pub memory_limit_mb: Option<u64>,

    /// CPU-time cap in seconds over the worker's whole life
    pub cpu_time_limit_secs: Option<u64>,
}

impl WorkerLimits {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn is_unlimited(&self) -> bool {
        self.memory_limit_mb.is_none() && self.cpu_time_limit_secs.is_none()
    }

    pub fn validate(&self) -> Result<(), String> {
        if let Some(memory) = self.memory_limit_mb {
            if memory < 64 {
                return Err("Memory limit cannot be less than 64MB".to_string());
            }
            if memory > 1_048_576 {
                return Err("Memory limit cannot exceed 1TB".to_string());
            }
        }

        if let Some(cpu) = self.cpu_time_limit_secs {
            if cpu == 0 {
                return Err("CPU time limit cannot be 0".to_string());
            }
        }

        Ok(())
    }

    /// Apply the limits to the calling process
    #[cfg(unix)]
    pub fn apply(&self) -> crate::utils::errors::Result<()> {
        use nix::sys::resource::{setrlimit, Resource};

        if let Some(memory) = self.memory_limit_mb {
            let bytes = (memory * 1024 * 1024) as libc::rlim_t;
            setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
            debug!("Address space limited to {}MB", memory);
        }

        if let Some(cpu) = self.cpu_time_limit_secs {
            // Hard limit one second later so SIGXCPU arrives before SIGKILL
            setrlimit(
                Resource::RLIMIT_CPU,
                cpu as libc::rlim_t,
                (cpu + 1) as libc::rlim_t,
            )?;
            debug!("CPU time limited to {}s", cpu);
        }

        Ok(())
    }

    #[cfg(not(unix))]
    pub fn apply(&self) -> crate::utils::errors::Result<()> {
        if !self.is_unlimited() {
            tracing::warn!("Worker resource limits are not supported on this platform");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_unlimited() {
        let limits = WorkerLimits::default();
        assert!(limits.is_unlimited());
        assert!(limits.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let too_small = WorkerLimits {
            memory_limit_mb: Some(32),
            ..Default::default()
        };
        assert!(too_small.validate().is_err());

        let zero_cpu = WorkerLimits {
            cpu_time_limit_secs: Some(0),
            ..Default::default()
        };
        assert!(zero_cpu.validate().is_err());

        let valid = WorkerLimits {
            memory_limit_mb: Some(512),
            cpu_time_limit_secs: Some(60),
        };
        assert!(valid.validate().is_ok());
    }

    #[test]
    fn test_unlimited_apply_is_noop() {
        assert!(WorkerLimits::unlimited().apply().is_ok());
    }
}
