use crate::process::types::ResourceUsage;
use chrono::Utc;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// OS introspection boundary: resource usage for a set of PIDs
///
/// `refresh` is called once per polling tick with every PID the supervisor
/// tracks, followed by one `sample` per PID.
pub trait ResourceSampler: Send {
    fn refresh(&mut self, pids: &[u32]);

    /// Latest usage for `pid`, or `None` if the OS no longer knows it
    fn sample(&self, pid: u32) -> Option<ResourceUsage>;
}

/// Process monitor collecting resource usage through sysinfo
pub struct SysinfoSampler {
    system: System,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SysinfoSampler {
    fn refresh(&mut self, pids: &[u32]) {
        if pids.is_empty() {
            return;
        }
        let sys_pids: Vec<Pid> = pids.iter().map(|pid| Pid::from_u32(*pid)).collect();
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&sys_pids),
            true,
            ProcessRefreshKind::everything(),
        );
    }

    fn sample(&self, pid: u32) -> Option<ResourceUsage> {
        let process = self.system.process(Pid::from_u32(pid))?;
        let disk = process.disk_usage();

        Some(ResourceUsage {
            cpu_percent: f64::from(process.cpu_usage()),
            memory_mb: process.memory() as f64 / BYTES_PER_MB,
            disk_io_bytes: disk.total_read_bytes + disk.total_written_bytes,
            open_files: open_file_count(pid),
            thread_count: process
                .tasks()
                .map(|tasks| tasks.len() as u64)
                .filter(|count| *count > 0)
                .unwrap_or(1),
            sampled_at: Utc::now(),
        })
    }
}

#[cfg(target_os = "linux")]
fn open_file_count(pid: u32) -> u64 {
    std::fs::read_dir(format!("/proc/{}/fd", pid))
        .map(|entries| entries.count() as u64)
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn open_file_count(_pid: u32) -> u64 {
    0
}
