//! The vault supervisor.
//!
//! A long-lived daemon that owns vault child processes: it persists their
//! configuration, spawns and stops them on request, brokers their identity
//! material through a short rendezvous at start-up, and periodically checks
//! for updated binaries and bootstrap data. Clients speak to it over the
//! framed TCP transport with the tagged control messages in [`rpc`].

pub mod config;
pub mod process;
pub mod rpc;
pub mod supervisor;
pub mod update;

pub use config::{SupervisorConfig, VaultEntry, CONFIG_FILE_NAME};
pub use process::{ProcessManager, VaultProcessControl, VaultProcessSpec};
pub use supervisor::{SupervisorOptions, VaultSupervisor, MAX_PORT, MIN_PORT};
pub use update::{Downloader, NullDownloader};
