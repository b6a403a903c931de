//! CPU usage sampling and throughput arithmetic

use std::time::{Duration, Instant};

/// Process CPU time (user + system) in seconds
#[cfg(unix)]
pub fn process_cpu_seconds() -> f64 {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let r = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    if r != 0 {
        return 0.0;
    }
    let tv = |t: libc::timeval| t.tv_sec as f64 + t.tv_usec as f64 / 1_000_000.0;
    tv(usage.ru_utime) + tv(usage.ru_stime)
}

#[cfg(not(unix))]
pub fn process_cpu_seconds() -> f64 {
    0.0
}

/// Wall clock plus process CPU clock, started together
#[derive(Clone, Copy, Debug)]
pub struct CpuClock {
    wall_start: Instant,
    cpu_start: f64,
}

impl CpuClock {
    pub fn start() -> Self {
        Self {
            wall_start: Instant::now(),
            cpu_start: process_cpu_seconds(),
        }
    }

    pub fn wall(&self) -> Duration {
        self.wall_start.elapsed()
    }

    /// CPU seconds consumed since `start`
    pub fn cpu_seconds(&self) -> f64 {
        (process_cpu_seconds() - self.cpu_start).max(0.0)
    }

    /// CPU usage in percent of all logical CPUs over the elapsed wall time
    pub fn usage_pct(&self) -> f64 {
        cpu_usage_pct(self.cpu_seconds(), self.wall().as_secs_f64(), num_cpus::get())
    }
}

/// `cpu / (wall * cpus) * 100`, zero when wall time is zero
pub fn cpu_usage_pct(cpu_seconds: f64, wall_seconds: f64, cpus: usize) -> f64 {
    if wall_seconds <= 0.0 || cpus == 0 {
        return 0.0;
    }
    cpu_seconds / (wall_seconds * cpus as f64) * 100.0
}

/// Rows per second; zero when nothing was timed
pub fn rows_per_sec(rows: u64, seconds: f64) -> f64 {
    if seconds > 0.0 {
        rows as f64 / seconds
    } else {
        0.0
    }
}

/// Megabytes (MiB) per second; `None` when the interval is zero
pub fn mb_per_sec(bytes: u64, seconds: f64) -> Option<f64> {
    (seconds > 0.0).then(|| bytes as f64 / 1_048_576.0 / seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_formula() {
        assert_eq!(cpu_usage_pct(2.0, 1.0, 4), 50.0);
        assert_eq!(cpu_usage_pct(1.0, 0.0, 4), 0.0);
        assert_eq!(cpu_usage_pct(1.0, 1.0, 0), 0.0);
    }

    #[test]
    fn throughput_helpers() {
        assert_eq!(rows_per_sec(6_001_215, 0.0), 0.0);
        assert_eq!(rows_per_sec(100, 2.0), 50.0);
        assert_eq!(mb_per_sec(2 * 1_048_576, 2.0), Some(1.0));
        assert_eq!(mb_per_sec(10, 0.0), None);
    }

    #[test]
    fn cpu_clock_is_monotonic_enough() {
        let c = CpuClock::start();
        let mut x = 0u64;
        for i in 0..200_000u64 {
            x = x.wrapping_add(i * i);
        }
        assert!(x > 0);
        assert!(c.cpu_seconds() >= 0.0);
        assert!(c.usage_pct() >= 0.0);
    }
}
