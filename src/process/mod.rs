// Local process manager - runs the fleet as tokio child processes

mod manager;
mod monitor;
mod restart;
mod spawner;
mod types;

pub use manager::LocalProcessManager;
pub use monitor::ProcessMonitor;
pub use restart::AutoRestart;
pub use spawner::{spawn_process, SpawnedProcess};
