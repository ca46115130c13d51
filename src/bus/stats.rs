use crate::adapter::{ProcessStatus, SupervisedProcess};
use serde::Serialize;
use std::collections::HashMap;

/// Name of the synthetic aggregate entry appended to every snapshot
pub const SYSTEM_ENTRY: &str = "__system__";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorDetail {
    pub code: Option<i32>,
    pub signal: Option<String>,
    pub unstable_restarts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessStats {
    pub name: String,
    pub pm_id: u32,
    pub status: ProcessStatus,
    pub cpu: f64,
    /// Memory reported by the process manager
    pub memory: u64,
    /// Resident memory from the OS, or `memory` when the OS lookup failed
    pub memory_resident: u64,
    pub uptime_ms: i64,
    pub restarts: u32,
    pub created_at: i64,
    pub updated_at: i64,
    pub error: Option<ErrorDetail>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStats {
    pub name: String,
    /// Sum of process cpu divided by core count
    pub cpu: f64,
    pub memory: u64,
    pub memory_resident: u64,
    pub total_memory: u64,
    pub memory_percent: f64,
    pub num_cpus: usize,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StatsEntry {
    Process(ProcessStats),
    System(SystemStats),
}

impl StatsEntry {
    pub fn name(&self) -> &str {
        match self {
            StatsEntry::Process(p) => &p.name,
            StatsEntry::System(s) => &s.name,
        }
    }
}

/// Inputs gathered from the OS alongside the process list
#[derive(Debug, Clone, Default)]
pub struct HostSample {
    /// Resident bytes per pid; pids missing here fall back to manager-reported memory
    pub resident: HashMap<u32, u64>,
    pub cores: usize,
    pub total_memory: u64,
}

/// Turn a process list into a stats snapshot ending with the `__system__` entry
pub fn build_snapshot<F>(
    list: Vec<SupervisedProcess>,
    host: &HostSample,
    now_ms: i64,
    allowed: F,
) -> Vec<StatsEntry>
where
    F: Fn(&str) -> bool,
{
    let mut entries: Vec<StatsEntry> = Vec::with_capacity(list.len() + 1);
    let mut cpu_sum = 0.0;
    let mut memory_sum = 0u64;
    let mut resident_sum = 0u64;

    for process in list.into_iter().filter(|p| allowed(&p.name)) {
        let resident = process
            .pid
            .and_then(|pid| host.resident.get(&pid).copied())
            .unwrap_or(process.memory_bytes);

        cpu_sum += process.cpu_percent;
        memory_sum += process.memory_bytes;
        resident_sum += resident;

        let error = (process.status == ProcessStatus::Errored).then(|| ErrorDetail {
            code: process.exit_code,
            signal: process.exit_signal.clone(),
            unstable_restarts: process.unstable_restarts,
        });

        entries.push(StatsEntry::Process(ProcessStats {
            uptime_ms: process.uptime_ms(now_ms),
            created_at: process.created_at.or(process.started_at).unwrap_or(now_ms),
            name: if process.name.is_empty() {
                "unnamed".to_string()
            } else {
                process.name
            },
            pm_id: process.numeric_id,
            status: process.status,
            cpu: process.cpu_percent,
            memory: process.memory_bytes,
            memory_resident: resident,
            restarts: process.restart_count,
            updated_at: now_ms,
            error,
        }));
    }

    let cores = host.cores.max(1);
    let memory_percent = if host.total_memory > 0 {
        resident_sum as f64 / host.total_memory as f64 * 100.0
    } else {
        0.0
    };

    entries.push(StatsEntry::System(SystemStats {
        name: SYSTEM_ENTRY.to_string(),
        cpu: cpu_sum / cores as f64,
        memory: memory_sum,
        memory_resident: resident_sum,
        total_memory: host.total_memory,
        memory_percent,
        num_cpus: cores,
        updated_at: now_ms,
    }));

    entries
}
