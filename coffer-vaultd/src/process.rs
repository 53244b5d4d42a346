//! Vault child process management.
//!
//! [`ProcessManager`] spawns and kills real vault executables;
//! [`VaultProcessControl`] is the seam the supervisor drives so tests can
//! substitute a fake.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use tokio::process::{Child, Command};
use tracing::{debug, warn};

pub type ProcessIndex = u32;

/// Everything needed to launch one vault child.
#[derive(Debug, Clone)]
pub struct VaultProcessSpec {
    pub executable: PathBuf,
    pub chunk_path: PathBuf,
    pub chunk_capacity: u64,
    pub bootstrap_endpoint: Option<String>,
}

impl VaultProcessSpec {
    /// The argument vector a vault child is started with.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(peer) = &self.bootstrap_endpoint {
            args.push("--peer".to_owned());
            args.push(peer.clone());
        }
        args.push("--chunk_path".to_owned());
        args.push(self.chunk_path.display().to_string());
        args.push("--chunk_capacity".to_owned());
        args.push(self.chunk_capacity.to_string());
        args.push("--start".to_owned());
        args
    }
}

/// The supervisor's view of process management.
pub trait VaultProcessControl: Send + Sync + 'static {
    /// Registers a child, returning its index, or `None` when the spec is
    /// unusable (for instance a missing executable).
    fn add_process(&self, spec: VaultProcessSpec) -> Option<ProcessIndex>;
    fn start_process(&self, index: ProcessIndex) -> bool;
    fn stop_process(&self, index: ProcessIndex) -> bool;
    fn restart_process(&self, index: ProcessIndex) -> bool;
    /// Forgets a registered child entirely, killing it if it is running.
    fn remove_process(&self, index: ProcessIndex) -> bool;
    /// Kills every child; called on supervisor shutdown.
    fn let_all_die(&self);
}

/// Real process management over [`tokio::process`].
#[derive(Debug, Default)]
pub struct ProcessManager {
    processes: Mutex<HashMap<ProcessIndex, Managed>>,
    next_index: AtomicU32,
}

#[derive(Debug)]
struct Managed {
    spec: VaultProcessSpec,
    child: Option<Child>,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VaultProcessControl for ProcessManager {
    fn add_process(&self, spec: VaultProcessSpec) -> Option<ProcessIndex> {
        if !spec.executable.is_file() {
            warn!(
                "vault executable {} does not exist",
                spec.executable.display()
            );
            return None;
        }
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        self.processes
            .lock()
            .unwrap()
            .insert(index, Managed { spec, child: None });
        Some(index)
    }

    fn start_process(&self, index: ProcessIndex) -> bool {
        let mut processes = self.processes.lock().unwrap();
        let Some(managed) = processes.get_mut(&index) else {
            warn!(index, "start requested for unknown process");
            return false;
        };
        if managed.child.is_some() {
            debug!(index, "process already running");
            return true;
        }
        match Command::new(&managed.spec.executable)
            .args(managed.spec.to_args())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => {
                debug!(index, "started vault process");
                managed.child = Some(child);
                true
            }
            Err(err) => {
                warn!(index, "failed to start vault process: {err}");
                false
            }
        }
    }

    fn stop_process(&self, index: ProcessIndex) -> bool {
        let mut processes = self.processes.lock().unwrap();
        let Some(managed) = processes.get_mut(&index) else {
            warn!(index, "stop requested for unknown process");
            return false;
        };
        match managed.child.take() {
            Some(mut child) => {
                if let Err(err) = child.start_kill() {
                    warn!(index, "failed to kill vault process: {err}");
                }
                true
            }
            None => {
                debug!(index, "process already stopped");
                true
            }
        }
    }

    fn restart_process(&self, index: ProcessIndex) -> bool {
        self.stop_process(index) && self.start_process(index)
    }

    fn remove_process(&self, index: ProcessIndex) -> bool {
        match self.processes.lock().unwrap().remove(&index) {
            Some(mut managed) => {
                if let Some(mut child) = managed.child.take() {
                    if let Err(err) = child.start_kill() {
                        warn!(index, "failed to kill vault process: {err}");
                    }
                }
                true
            }
            None => {
                warn!(index, "remove requested for unknown process");
                false
            }
        }
    }

    fn let_all_die(&self) {
        let mut processes = self.processes.lock().unwrap();
        for (index, managed) in processes.iter_mut() {
            if let Some(mut child) = managed.child.take() {
                if let Err(err) = child.start_kill() {
                    warn!(index, "failed to kill vault process: {err}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_follow_the_child_contract() {
        let spec = VaultProcessSpec {
            executable: PathBuf::from("/opt/coffer/coffer-vault"),
            chunk_path: PathBuf::from("/var/lib/coffer/VAULTID"),
            chunk_capacity: 1024,
            bootstrap_endpoint: Some("10.0.0.1:5483".into()),
        };
        assert_eq!(
            spec.to_args(),
            vec![
                "--peer",
                "10.0.0.1:5483",
                "--chunk_path",
                "/var/lib/coffer/VAULTID",
                "--chunk_capacity",
                "1024",
                "--start",
            ]
        );

        let no_peer = VaultProcessSpec {
            bootstrap_endpoint: None,
            ..spec
        };
        assert_eq!(no_peer.to_args().first().map(String::as_str), Some("--chunk_path"));
    }

    #[test]
    fn unknown_executables_are_rejected() {
        let manager = ProcessManager::new();
        let spec = VaultProcessSpec {
            executable: PathBuf::from("/nonexistent/coffer-vault"),
            chunk_path: PathBuf::from("/tmp/chunks"),
            chunk_capacity: 0,
            bootstrap_endpoint: None,
        };
        assert!(manager.add_process(spec).is_none());
        assert!(!manager.start_process(7));
        assert!(!manager.remove_process(7));
    }
}
