// Scriptable in-memory adapter for unit tests

use super::{BusRecord, ExecMode, ProcessAdapter, ProcessStatus, StartSpec, SupervisedProcess};
use crate::error::{Result, WardenError};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq)]
pub enum AdapterCall {
    List,
    Describe(String),
    Start(String),
    Restart(String),
    Reload(String),
    Stop(String),
    Delete(String),
    SetEnv(String, String, String),
    Signal(String, String),
    Message(u32, serde_json::Value),
    Dump,
}

pub struct FakeAdapter {
    processes: Mutex<Vec<SupervisedProcess>>,
    calls: Mutex<Vec<AdapterCall>>,
    failing: Mutex<HashSet<&'static str>>,
    hanging: Mutex<HashSet<&'static str>>,
    bus: Mutex<Option<broadcast::Sender<BusRecord>>>,
    bus_broken: Mutex<bool>,
}

impl FakeAdapter {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(256);
        Self {
            processes: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            hanging: Mutex::new(HashSet::new()),
            bus: Mutex::new(Some(bus)),
            bus_broken: Mutex::new(false),
        }
    }

    /// An online fork-mode process with no load
    pub fn process(name: &str, numeric_id: u32) -> SupervisedProcess {
        SupervisedProcess {
            name: name.to_string(),
            numeric_id,
            exec_mode: ExecMode::Fork,
            status: ProcessStatus::Online,
            created_at: Some(0),
            started_at: Some(0),
            ..Default::default()
        }
    }

    pub fn add(&self, process: SupervisedProcess) {
        self.processes.lock().unwrap().push(process);
    }

    pub fn update<F: FnOnce(&mut SupervisedProcess)>(&self, name: &str, f: F) {
        let mut processes = self.processes.lock().unwrap();
        if let Some(p) = processes.iter_mut().find(|p| p.name == name) {
            f(p);
        }
    }

    pub fn set_metrics(&self, name: &str, cpu_percent: f64, memory_mb: f64) {
        self.update(name, |p| {
            p.cpu_percent = cpu_percent;
            p.memory_bytes = (memory_mb * 1024.0 * 1024.0) as u64;
        });
    }

    pub fn names(&self) -> Vec<String> {
        self.processes
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.name.clone())
            .collect()
    }

    /// Make every call of `op` fail
    pub fn fail(&self, op: &'static str) {
        self.failing.lock().unwrap().insert(op);
    }

    /// Make every call of `op` never return
    pub fn hang(&self, op: &'static str) {
        self.hanging.lock().unwrap().insert(op);
    }

    pub fn break_bus(&self) {
        *self.bus_broken.lock().unwrap() = true;
    }

    /// Drop the push channel sender; attached receivers observe the close
    pub fn close_bus(&self) {
        self.bus.lock().unwrap().take();
    }

    pub fn push(&self, record: BusRecord) {
        if let Some(bus) = self.bus.lock().unwrap().as_ref() {
            let _ = bus.send(record);
        }
    }

    pub fn calls(&self) -> Vec<AdapterCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count<F: Fn(&AdapterCall) -> bool>(&self, pred: F) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    async fn record(&self, op: &'static str, call: AdapterCall) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        let hangs = self.hanging.lock().unwrap().contains(op);
        if hangs {
            std::future::pending::<()>().await;
        }
        if self.failing.lock().unwrap().contains(op) {
            return Err(WardenError::call_failed(op, "scripted failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl ProcessAdapter for FakeAdapter {
    async fn list(&self) -> Result<Vec<SupervisedProcess>> {
        self.record("list", AdapterCall::List).await?;
        Ok(self.processes.lock().unwrap().clone())
    }

    async fn describe(&self, name: &str) -> Result<Option<SupervisedProcess>> {
        self.record("describe", AdapterCall::Describe(name.to_string()))
            .await?;
        Ok(self
            .processes
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.name == name)
            .cloned())
    }

    async fn start(&self, spec: &StartSpec) -> Result<()> {
        self.record("start", AdapterCall::Start(spec.name.clone()))
            .await?;
        let mut processes = self.processes.lock().unwrap();
        let id = processes.len() as u32;
        let mut process = Self::process(&spec.name, id);
        process.exec_mode = spec.exec_mode;
        processes.push(process);
        Ok(())
    }

    async fn restart(&self, name: &str) -> Result<()> {
        self.record("restart", AdapterCall::Restart(name.to_string()))
            .await?;
        self.update(name, |p| {
            p.restart_count += 1;
            p.status = ProcessStatus::Online;
        });
        Ok(())
    }

    async fn reload(&self, name: &str) -> Result<()> {
        self.record("reload", AdapterCall::Reload(name.to_string()))
            .await?;
        self.update(name, |p| p.restart_count += 1);
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.record("stop", AdapterCall::Stop(name.to_string()))
            .await?;
        self.update(name, |p| p.status = ProcessStatus::Stopped);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.record("delete", AdapterCall::Delete(name.to_string()))
            .await?;
        let mut processes = self.processes.lock().unwrap();
        let before = processes.len();
        processes.retain(|p| p.name != name);
        if processes.len() == before {
            return Err(WardenError::ProcessNotFound(name.to_string()));
        }
        Ok(())
    }

    async fn set_env(&self, name: &str, key: &str, value: &str) -> Result<()> {
        self.record(
            "set_env",
            AdapterCall::SetEnv(name.to_string(), key.to_string(), value.to_string()),
        )
        .await?;
        self.update(name, |p| {
            if key == "note" {
                p.note = Some(value.to_string());
            } else {
                p.env.insert(key.to_string(), value.to_string());
            }
        });
        Ok(())
    }

    async fn send_signal(&self, signal: &str, name: &str) -> Result<()> {
        self.record(
            "send_signal",
            AdapterCall::Signal(signal.to_string(), name.to_string()),
        )
        .await
    }

    async fn send_message(&self, numeric_id: u32, payload: &serde_json::Value) -> Result<()> {
        self.record("send_message", AdapterCall::Message(numeric_id, payload.clone()))
            .await
    }

    async fn dump(&self) -> Result<()> {
        self.record("dump", AdapterCall::Dump).await
    }

    fn bus(&self) -> Result<broadcast::Receiver<BusRecord>> {
        if *self.bus_broken.lock().unwrap() {
            return Err(WardenError::call_failed("bus", "bus unavailable"));
        }
        self.bus
            .lock()
            .unwrap()
            .as_ref()
            .map(|bus| bus.subscribe())
            .ok_or_else(|| WardenError::call_failed("bus", "bus closed"))
    }
}
