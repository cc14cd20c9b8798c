// ABOUTME: Load probes that report CPU load and free memory for sampling.
// ABOUTME: SystemLoadProbe reads the host via libc; FixedLoadProbe is for tests.

use parking_lot::Mutex;

/// A point-in-time view of host load.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SystemLoad {
    /// One-minute load average divided by CPU count.
    pub cpu_load: f64,
    pub mem_free_mb: u64,
}

/// Source of host load readings for the concurrency controller.
pub trait LoadProbe: Send + Sync {
    fn sample(&self) -> SystemLoad;
}

/// Reads load average and free memory from the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLoadProbe;

impl LoadProbe for SystemLoadProbe {
    fn sample(&self) -> SystemLoad {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1) as f64;
        SystemLoad {
            cpu_load: load_average().map(|l| l / cpus).unwrap_or(0.0),
            mem_free_mb: free_memory_mb().unwrap_or(u64::MAX / 2),
        }
    }
}

#[cfg(unix)]
fn load_average() -> Option<f64> {
    let mut loads = [0f64; 3];
    // SAFETY: the buffer holds 3 doubles and we ask for 1.
    let n = unsafe { libc::getloadavg(loads.as_mut_ptr(), 1) };
    if n >= 1 { Some(loads[0]) } else { None }
}

#[cfg(not(unix))]
fn load_average() -> Option<f64> {
    None
}

#[cfg(target_os = "linux")]
fn free_memory_mb() -> Option<u64> {
    // SAFETY: sysinfo only writes into the zeroed struct we pass.
    let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
    if unsafe { libc::sysinfo(&mut info) } != 0 {
        return None;
    }
    let unit = u64::from(info.mem_unit.max(1));
    let free = (info.freeram as u64 + info.bufferram as u64) * unit;
    Some(free / (1024 * 1024))
}

#[cfg(not(target_os = "linux"))]
fn free_memory_mb() -> Option<u64> {
    None
}

/// Probe returning scripted readings; the last reading repeats forever.
#[derive(Debug)]
pub struct FixedLoadProbe {
    readings: Mutex<Vec<SystemLoad>>,
}

impl FixedLoadProbe {
    /// Always report the same load.
    pub fn new(cpu_load: f64, mem_free_mb: u64) -> Self {
        Self::scripted(vec![SystemLoad {
            cpu_load,
            mem_free_mb,
        }])
    }

    /// Report readings in order, repeating the last one.
    pub fn scripted(readings: Vec<SystemLoad>) -> Self {
        Self {
            readings: Mutex::new(readings),
        }
    }

    /// A lightly loaded host.
    pub fn idle() -> Self {
        Self::new(0.1, 16 * 1024)
    }
}

impl LoadProbe for FixedLoadProbe {
    fn sample(&self) -> SystemLoad {
        let mut readings = self.readings.lock();
        match readings.len() {
            0 => SystemLoad {
                cpu_load: 0.0,
                mem_free_mb: u64::MAX / 2,
            },
            1 => readings[0],
            _ => readings.remove(0),
        }
    }
}
