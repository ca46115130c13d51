use crate::adapter::BusRecord;
use crate::config::ProcessConfig;
use crate::error::{Result, WardenError};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::broadcast;

/// Metadata returned when spawning a process
#[derive(Debug)]
pub struct SpawnedProcess {
    /// The child process handle
    pub child: Child,

    /// Process ID assigned by the OS
    pub pid: u32,

    /// Write end of the child's stdin, used for structured messages
    pub stdin: Option<ChildStdin>,
}

/// Spawn a fleet process and relay its output onto the push bus
///
/// Every stdout line becomes a `Log` record and every stderr line an
/// `ErrorLog` record tagged with the process name and numeric id.
///
/// # Arguments
/// * `config` - Process definition
/// * `numeric_id` - Id the manager assigned to this entry
/// * `bus` - Push channel the output is relayed to
///
/// # Returns
/// * `Ok(SpawnedProcess)` - Successfully spawned process with metadata
/// * `Err(WardenError)` - Failed to spawn process
pub async fn spawn_process(
    config: &ProcessConfig,
    numeric_id: u32,
    bus: &broadcast::Sender<BusRecord>,
) -> Result<SpawnedProcess> {
    if !config.script.exists() {
        return Err(WardenError::SpawnError(format!(
            "Script does not exist: {}",
            config.script.display()
        )));
    }

    let mut command = Command::new(&config.script);
    command.args(&config.args);

    if let Some(ref cwd) = config.cwd {
        command.current_dir(cwd);
    }

    command.envs(&config.env);

    command.stdin(Stdio::piped());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    command.kill_on_drop(true);

    let mut child = command.spawn().map_err(|e| {
        WardenError::SpawnError(format!("Failed to spawn process '{}': {}", config.name, e))
    })?;

    let pid = child.id().ok_or_else(|| {
        WardenError::SpawnError(format!("Failed to get PID for process '{}'", config.name))
    })?;

    if let Some(stdout) = child.stdout.take() {
        relay_lines(stdout, config.name.clone(), numeric_id, bus.clone(), false);
    }
    if let Some(stderr) = child.stderr.take() {
        relay_lines(stderr, config.name.clone(), numeric_id, bus.clone(), true);
    }

    let stdin = child.stdin.take();

    Ok(SpawnedProcess { child, pid, stdin })
}

fn relay_lines<R>(
    reader: R,
    name: String,
    numeric_id: u32,
    bus: broadcast::Sender<BusRecord>,
    is_stderr: bool,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    // Invalid UTF-8 is replaced; the pipe must keep draining
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']);
                    let record = if is_stderr {
                        BusRecord::error_log(name.as_str(), numeric_id, line)
                    } else {
                        BusRecord::log(name.as_str(), numeric_id, line)
                    };
                    // No receivers is fine; output is dropped until someone listens.
                    let _ = bus.send(record);
                }
                Err(e) => {
                    tracing::debug!(process = %name, "output relay stopped: {}", e);
                    break;
                }
            }
        }
    });
}
