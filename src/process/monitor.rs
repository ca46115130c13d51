use crate::process::types::ManagedProcess;
use std::collections::HashMap;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// OS-level resource probe backed by sysinfo
pub struct ProcessMonitor {
    system: System,
}

impl ProcessMonitor {
    pub fn new() -> Self {
        Self {
            system: System::new_all(),
        }
    }

    /// Refresh cpu and memory for every running entry
    pub fn update_all_stats<'a, I>(&mut self, processes: I)
    where
        I: Iterator<Item = &'a mut ManagedProcess>,
    {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::new().with_cpu().with_memory(),
        );

        for process in processes {
            let Some(pid) = process.stats.pid else {
                continue;
            };
            if let Some(sys_process) = self.system.process(Pid::from_u32(pid)) {
                process.stats.cpu_usage = sys_process.cpu_usage();
                process.stats.memory_usage = sys_process.memory();
            }
        }
    }

    /// Resident set size for each pid the OS still knows about
    ///
    /// Pids missing from the result could not be resolved; callers fall back
    /// to whatever the process manager reports.
    pub fn resident_memory(&mut self, pids: &[u32]) -> HashMap<u32, u64> {
        if pids.is_empty() {
            return HashMap::new();
        }
        let sys_pids: Vec<Pid> = pids.iter().map(|&p| Pid::from_u32(p)).collect();
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&sys_pids),
            true,
            ProcessRefreshKind::new().with_memory(),
        );

        pids.iter()
            .filter_map(|&pid| {
                self.system
                    .process(Pid::from_u32(pid))
                    .map(|p| (pid, p.memory()))
            })
            .collect()
    }

    /// Total physical memory in bytes
    pub fn total_memory(&mut self) -> u64 {
        self.system.refresh_memory();
        self.system.total_memory()
    }

    pub fn cpu_count(&self) -> usize {
        self.system.cpus().len().max(1)
    }
}

impl Default for ProcessMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::process::Command;

    #[tokio::test]
    async fn test_resident_memory_for_live_process() {
        let mut monitor = ProcessMonitor::new();
        let mut child = Command::new("/bin/sleep")
            .arg("5")
            .spawn()
            .expect("Failed to spawn process");
        let pid = child.id().expect("Failed to get PID");

        let resident = monitor.resident_memory(&[pid]);
        assert!(resident.get(&pid).copied().unwrap_or(0) > 0);

        child.kill().await.expect("Failed to kill process");
        let _ = child.wait().await;
    }

    #[test]
    fn test_unknown_pid_is_missing() {
        let mut monitor = ProcessMonitor::new();
        let resident = monitor.resident_memory(&[u32::MAX - 1]);
        assert!(resident.is_empty());
    }

    #[test]
    fn test_system_totals() {
        let mut monitor = ProcessMonitor::new();
        assert!(monitor.cpu_count() >= 1);
        assert!(monitor.total_memory() > 0);
    }
}
