use super::{BusRecord, ProcessAdapter, StartSpec, SupervisedProcess};
use crate::error::{Result, WardenError};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast;

/// Upper bounds for each kind of manager call
#[derive(Debug, Clone, Copy)]
pub struct CallTimeouts {
    pub list: Duration,
    pub describe: Duration,
    pub start: Duration,
    pub restart: Duration,
    pub stop: Duration,
    pub delete: Duration,
    /// Env, signal, message and dump calls
    pub control: Duration,
}

impl Default for CallTimeouts {
    fn default() -> Self {
        Self {
            list: Duration::from_secs(5),
            describe: Duration::from_secs(5),
            start: Duration::from_secs(30),
            restart: Duration::from_secs(30),
            stop: Duration::from_secs(30),
            delete: Duration::from_secs(10),
            control: Duration::from_secs(5),
        }
    }
}

/// Wraps an adapter so no call can hang its caller
pub struct TimedAdapter<A> {
    inner: A,
    timeouts: CallTimeouts,
}

impl<A: ProcessAdapter> TimedAdapter<A> {
    pub fn new(inner: A) -> Self {
        Self::with_timeouts(inner, CallTimeouts::default())
    }

    pub fn with_timeouts(inner: A, timeouts: CallTimeouts) -> Self {
        Self { inner, timeouts }
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }

    async fn bounded<T, F>(op: &'static str, target: &str, limit: Duration, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(op, process = target, ?limit, "process manager call timed out");
                Err(WardenError::AdapterTimeout {
                    op,
                    target: target.to_string(),
                })
            }
        }
    }
}

#[async_trait]
impl<A: ProcessAdapter> ProcessAdapter for TimedAdapter<A> {
    async fn list(&self) -> Result<Vec<SupervisedProcess>> {
        Self::bounded("list", "*", self.timeouts.list, self.inner.list()).await
    }

    async fn describe(&self, name: &str) -> Result<Option<SupervisedProcess>> {
        Self::bounded("describe", name, self.timeouts.describe, self.inner.describe(name)).await
    }

    async fn start(&self, spec: &StartSpec) -> Result<()> {
        Self::bounded("start", &spec.name, self.timeouts.start, self.inner.start(spec)).await
    }

    async fn restart(&self, name: &str) -> Result<()> {
        Self::bounded("restart", name, self.timeouts.restart, self.inner.restart(name)).await
    }

    async fn reload(&self, name: &str) -> Result<()> {
        Self::bounded("reload", name, self.timeouts.restart, self.inner.reload(name)).await
    }

    async fn stop(&self, name: &str) -> Result<()> {
        Self::bounded("stop", name, self.timeouts.stop, self.inner.stop(name)).await
    }

    async fn delete(&self, name: &str) -> Result<()> {
        Self::bounded("delete", name, self.timeouts.delete, self.inner.delete(name)).await
    }

    async fn set_env(&self, name: &str, key: &str, value: &str) -> Result<()> {
        Self::bounded(
            "set_env",
            name,
            self.timeouts.control,
            self.inner.set_env(name, key, value),
        )
        .await
    }

    async fn send_signal(&self, signal: &str, name: &str) -> Result<()> {
        Self::bounded(
            "send_signal",
            name,
            self.timeouts.control,
            self.inner.send_signal(signal, name),
        )
        .await
    }

    async fn send_message(&self, numeric_id: u32, payload: &serde_json::Value) -> Result<()> {
        let target = numeric_id.to_string();
        Self::bounded(
            "send_message",
            &target,
            self.timeouts.control,
            self.inner.send_message(numeric_id, payload),
        )
        .await
    }

    async fn dump(&self) -> Result<()> {
        Self::bounded("dump", "*", self.timeouts.control, self.inner.dump()).await
    }

    fn bus(&self) -> Result<broadcast::Receiver<BusRecord>> {
        self.inner.bus()
    }
}
