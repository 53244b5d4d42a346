//! The supervisor proper: the vault table, request dispatch, the start
//! rendezvous, and the update schedule.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use tokio::sync::{mpsc, Notify};
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use coffer_net::codec::unwrap_message;
use coffer_net::{
    IncomingMessage, MessageType, OutgoingResponse, TcpTransport, TransportError, TransportEvent,
};
use coffer_store::{Keys, SignedData};

use crate::config::{SupervisorConfig, VaultEntry, CONFIG_FILE_NAME};
use crate::process::{ProcessIndex, VaultProcessControl, VaultProcessSpec};
use crate::rpc;
use crate::update::{
    self, Downloader, BOOTSTRAP_GLOBAL, MAX_UPDATE_INTERVAL, MIN_UPDATE_INTERVAL, VAULT_NAME,
};

/// The supervisor binds the first free port scanning upward from here.
pub const MIN_PORT: u16 = 5483;
pub const MAX_PORT: u16 = 5582;

/// How long a start request waits for the new child's identity request.
const RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(3);

pub struct SupervisorOptions {
    pub process_control: Arc<dyn VaultProcessControl>,
    pub downloader: Arc<dyn Downloader>,
    /// Overrides the config file location; mainly for tests. `None` applies
    /// the working-directory-then-system-directory preference.
    pub config_dir: Option<PathBuf>,
    pub rendezvous_timeout: Duration,
}

impl SupervisorOptions {
    pub fn new(process_control: Arc<dyn VaultProcessControl>, downloader: Arc<dyn Downloader>) -> Self {
        Self {
            process_control,
            downloader,
            config_dir: None,
            rendezvous_timeout: RENDEZVOUS_TIMEOUT,
        }
    }

    pub fn with_config_dir(mut self, config_dir: Option<PathBuf>) -> Self {
        self.config_dir = config_dir;
        self
    }
}

/// One vault under supervision.
struct VaultRecord {
    process_index: ProcessIndex,
    account_name: String,
    keys: Keys,
    chunkstore_path: PathBuf,
    chunkstore_capacity: u64,
    /// Port of the client that asked for this vault to start.
    client_port: u16,
    /// Port the vault itself listens on; unknown until the vault reports it.
    #[allow(dead_code)]
    vault_port: u16,
    requested_to_run: bool,
    /// Whether the child has asked for its identity yet.
    vault_requested: bool,
    rendezvous: Arc<Rendezvous>,
}

impl VaultRecord {
    fn to_entry(&self) -> VaultEntry {
        VaultEntry {
            account_name: self.account_name.clone(),
            keys: self.keys.to_bytes(),
            chunkstore_path: self.chunkstore_path.display().to_string(),
            chunkstore_capacity: self.chunkstore_capacity,
            requested_to_run: self.requested_to_run,
        }
    }
}

/// The start/identity rendezvous: the start handler parks here until the
/// child's identity request signals it.
#[derive(Default)]
struct Rendezvous {
    requested: Mutex<bool>,
    notify: Notify,
}

impl Rendezvous {
    fn signal(&self) {
        *self.requested.lock().unwrap() = true;
        self.notify.notify_waiters();
    }

    fn is_signaled(&self) -> bool {
        *self.requested.lock().unwrap()
    }

    async fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_signaled() {
                return true;
            }
            let notified = self.notify.notified();
            // Re-check after registering so a signal between the check and
            // the registration is not lost.
            if self.is_signaled() {
                return true;
            }
            if timeout_at(deadline, notified).await.is_err() {
                return self.is_signaled();
            }
        }
    }
}

struct Inner {
    config_path: PathBuf,
    process_control: Arc<dyn VaultProcessControl>,
    downloader: Arc<dyn Downloader>,
    vaults: Mutex<Vec<VaultRecord>>,
    update_interval: Mutex<Duration>,
    update_rearm: Notify,
    rendezvous_timeout: Duration,
    cancel: CancellationToken,
}

/// The running supervisor daemon.
pub struct VaultSupervisor {
    inner: Arc<Inner>,
    transport: TcpTransport,
    tasks: TaskTracker,
    port: u16,
}

impl VaultSupervisor {
    /// Resolves and loads (or freshly writes) the config, binds the
    /// transport by scanning upward from [`MIN_PORT`], registers and starts
    /// the configured vaults, and spawns the dispatch and update tasks.
    pub async fn start(options: SupervisorOptions) -> anyhow::Result<Self> {
        let config_path = match &options.config_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
                dir.join(CONFIG_FILE_NAME)
            }
            None => crate::config::establish_config_path()?,
        };
        let config = if config_path.exists() {
            SupervisorConfig::load(&config_path)?
        } else {
            let config = SupervisorConfig::default();
            config.save(&config_path)?;
            info!("wrote fresh config at {}", config_path.display());
            config
        };

        let (mut transport, events) = TcpTransport::new();
        let port = bind_first_free_port(&mut transport).await?;

        let inner = Arc::new(Inner {
            config_path,
            process_control: options.process_control,
            downloader: options.downloader,
            vaults: Mutex::new(Vec::new()),
            update_interval: Mutex::new(Duration::from_secs(config.update_interval_secs)),
            update_rearm: Notify::new(),
            rendezvous_timeout: options.rendezvous_timeout,
            cancel: CancellationToken::new(),
        });
        inner.load_vaults(&config.vaults);

        let tasks = TaskTracker::new();
        tasks.spawn(dispatch_loop(inner.clone(), events, tasks.clone()));
        tasks.spawn(update_loop(inner.clone()));

        info!(port, "vault supervisor started");
        Ok(Self {
            inner,
            transport,
            tasks,
            port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn config_path(&self) -> &Path {
        &self.inner.config_path
    }

    /// Cooperative shutdown: kill the children, cancel the timers and
    /// connections, and wait for every task to finish.
    pub async fn shutdown(mut self) {
        info!("vault supervisor shutting down");
        self.inner.process_control.let_all_die();
        self.inner.cancel.cancel();
        self.transport.shutdown().await;
        self.tasks.close();
        self.tasks.wait().await;
    }
}

async fn bind_first_free_port(transport: &mut TcpTransport) -> anyhow::Result<u16> {
    for port in MIN_PORT..=MAX_PORT {
        match transport
            .start_listening(std::net::SocketAddr::from(([127, 0, 0, 1], port)))
            .await
        {
            Ok(port) => return Ok(port),
            Err(TransportError::BindError | TransportError::ListenError) => continue,
            Err(err) => return Err(err).context("failed to start listening"),
        }
    }
    anyhow::bail!("no free port in {MIN_PORT}-{MAX_PORT}")
}

async fn dispatch_loop(
    inner: Arc<Inner>,
    mut events: mpsc::Receiver<TransportEvent>,
    tasks: TaskTracker,
) {
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(TransportEvent::Message(message)) => {
                    // Handlers may park on the rendezvous, so each message
                    // gets its own task.
                    tasks.spawn(handle_message(inner.clone(), message));
                }
                Some(TransportEvent::Error { error, peer }) => {
                    warn!(?peer, "transport error: {error}");
                }
                None => break,
            },
        }
    }
}

async fn handle_message(inner: Arc<Inner>, message: IncomingMessage) {
    let Some((typ, body)) = unwrap_message(&message.payload) else {
        debug!(peer = %message.peer, "dropping unparseable message");
        return;
    };
    debug!(peer = %message.peer, ?typ, "handling request");
    let response = match typ {
        MessageType::Ping => handle_ping(&body),
        MessageType::StartVaultRequest => {
            handle_start_vault(&inner, &body, message.peer.port()).await
        }
        MessageType::VaultIdentityRequest => handle_vault_identity(&inner, &body),
        MessageType::StopVaultRequest => handle_stop_vault(&inner, &body),
        MessageType::UpdateIntervalRequest => handle_update_interval(&inner, &body),
        other => {
            debug!(?other, "unexpected message type");
            None
        }
    };
    if let Some(payload) = response {
        let _ = message.reply.send(OutgoingResponse::closing(payload));
    }
}

fn handle_ping(body: &[u8]) -> Option<Bytes> {
    let ping: rpc::Ping = rpc::decode(body)?;
    Some(rpc::encode(MessageType::Ping, &ping))
}

async fn handle_start_vault(inner: &Arc<Inner>, body: &[u8], client_port: u16) -> Option<Bytes> {
    let request: rpc::StartVaultRequest = rpc::decode(body)?;
    let respond = |result: bool| {
        Some(rpc::encode(
            MessageType::StartVaultResponse,
            &rpc::StartVaultResponse { result },
        ))
    };

    let Ok(keys) = Keys::from_bytes(&request.keys) else {
        warn!("start request with unparseable keys");
        return respond(false);
    };
    let short_id = coffer_util::short_id(&keys.identity);
    // Refuse duplicates up front, before anything is registered for them.
    {
        let vaults = inner.vaults.lock().unwrap();
        if vaults.iter().any(|record| record.keys.identity == keys.identity) {
            warn!(vault = %short_id, "vault identity already registered");
            return respond(false);
        }
    }
    let config_dir = inner.config_dir().to_path_buf();
    let chunkstore_path = config_dir.join(&short_id);
    if !ensure_bootstrap_file(&config_dir, &short_id) {
        return respond(false);
    }

    let spec = VaultProcessSpec {
        executable: inner.vault_executable(),
        chunk_path: chunkstore_path.clone(),
        chunk_capacity: 0,
        bootstrap_endpoint: request.bootstrap_endpoint.clone(),
    };
    let Some(process_index) = inner.process_control.add_process(spec) else {
        return respond(false);
    };

    let rendezvous = Arc::new(Rendezvous::default());
    {
        let mut vaults = inner.vaults.lock().unwrap();
        if vaults.iter().any(|record| record.keys.identity == keys.identity) {
            // An identical request won the race since the check above; drop
            // the child entry registered for this one.
            inner.process_control.remove_process(process_index);
            warn!(vault = %short_id, "vault identity already registered");
            return respond(false);
        }
        vaults.push(VaultRecord {
            process_index,
            account_name: request.account_name.clone(),
            keys,
            chunkstore_path,
            chunkstore_capacity: 0,
            client_port,
            vault_port: 0,
            requested_to_run: true,
            vault_requested: false,
            rendezvous: rendezvous.clone(),
        });
    }
    inner.process_control.start_process(process_index);
    inner.write_config();

    // Block until the new child asks for its identity; the client's
    // response is not sent before then.
    let signaled = tokio::select! {
        _ = inner.cancel.cancelled() => return None,
        signaled = rendezvous.wait(inner.rendezvous_timeout) => signaled,
    };
    if !signaled {
        warn!(vault = %short_id, "vault did not request its identity in time");
        return respond(false);
    }
    respond(true)
}

fn handle_vault_identity(inner: &Arc<Inner>, body: &[u8]) -> Option<Bytes> {
    let request: rpc::VaultIdentityRequest = rpc::decode(body)?;
    let mut response = rpc::VaultIdentityResponse {
        account_name: String::new(),
        keys: Bytes::new(),
    };
    {
        let mut vaults = inner.vaults.lock().unwrap();
        match vaults
            .iter_mut()
            .find(|record| record.process_index == request.process_index)
        {
            Some(record) => {
                response.account_name = record.account_name.clone();
                response.keys = record.keys.to_bytes();
                if !record.vault_requested {
                    record.vault_requested = true;
                    // Release the start handler waiting on this vault.
                    record.rendezvous.signal();
                }
            }
            None => {
                warn!(
                    process_index = request.process_index,
                    "identity request from unknown process"
                );
            }
        }
    }
    Some(rpc::encode(MessageType::VaultIdentityResponse, &response))
}

fn handle_stop_vault(inner: &Arc<Inner>, body: &[u8]) -> Option<Bytes> {
    let request: rpc::StopVaultRequest = rpc::decode(body)?;
    let result = inner.stop_vault(&request);
    Some(rpc::encode(
        MessageType::VaultShutdownResponse,
        &rpc::VaultShutdownResponse { result },
    ))
}

fn handle_update_interval(inner: &Arc<Inner>, body: &[u8]) -> Option<Bytes> {
    let request: rpc::UpdateIntervalRequest = rpc::decode(body)?;
    let interval_secs = match request.new_interval_secs {
        Some(secs) => {
            let new_interval = Duration::from_secs(secs);
            if (MIN_UPDATE_INTERVAL..=MAX_UPDATE_INTERVAL).contains(&new_interval) {
                *inner.update_interval.lock().unwrap() = new_interval;
                inner.update_rearm.notify_waiters();
                inner.write_config();
                secs
            } else {
                warn!(secs, "rejecting out-of-range update interval");
                0
            }
        }
        None => inner.update_interval.lock().unwrap().as_secs(),
    };
    Some(rpc::encode(
        MessageType::UpdateIntervalResponse,
        &rpc::UpdateIntervalResponse { interval_secs },
    ))
}

/// Makes sure the per-vault bootstrap file exists, copying the global one on
/// first use.
fn ensure_bootstrap_file(config_dir: &Path, short_id: &str) -> bool {
    if let Err(err) = std::fs::create_dir_all(config_dir) {
        warn!("failed to create {}: {err}", config_dir.display());
        return false;
    }
    let vault_bootstrap = config_dir.join(format!("bootstrap-{short_id}.dat"));
    if vault_bootstrap.exists() {
        return true;
    }
    match std::fs::copy(config_dir.join(BOOTSTRAP_GLOBAL), &vault_bootstrap) {
        Ok(_) => true,
        Err(err) => {
            warn!(
                "failed to copy global bootstrap file to {}: {err}",
                vault_bootstrap.display()
            );
            false
        }
    }
}

async fn update_loop(inner: Arc<Inner>) {
    // First check runs immediately; thereafter one per interval.
    inner.check_for_updates();
    loop {
        let interval = *inner.update_interval.lock().unwrap();
        tokio::select! {
            // Cancellation exits without rescheduling.
            _ = inner.cancel.cancelled() => break,
            // The interval changed; sleep again with the new value.
            _ = inner.update_rearm.notified() => continue,
            _ = tokio::time::sleep(interval) => inner.check_for_updates(),
        }
    }
}

impl Inner {
    fn config_dir(&self) -> &Path {
        self.config_path.parent().unwrap_or_else(|| Path::new("."))
    }

    fn vault_executable(&self) -> PathBuf {
        self.config_dir()
            .join(format!("{VAULT_NAME}{}", std::env::consts::EXE_SUFFIX))
    }

    /// Registers the persisted vaults and starts the ones that were running.
    fn load_vaults(&self, entries: &[VaultEntry]) {
        let mut vaults = self.vaults.lock().unwrap();
        for entry in entries {
            let Ok(keys) = Keys::from_bytes(&entry.keys) else {
                warn!(
                    account = %entry.account_name,
                    "skipping configured vault with unparseable keys"
                );
                continue;
            };
            let spec = VaultProcessSpec {
                executable: self.vault_executable(),
                chunk_path: PathBuf::from(&entry.chunkstore_path),
                chunk_capacity: entry.chunkstore_capacity,
                bootstrap_endpoint: None,
            };
            let Some(process_index) = self.process_control.add_process(spec) else {
                warn!(account = %entry.account_name, "could not register configured vault");
                continue;
            };
            if entry.requested_to_run {
                self.process_control.start_process(process_index);
            }
            vaults.push(VaultRecord {
                process_index,
                account_name: entry.account_name.clone(),
                keys,
                chunkstore_path: PathBuf::from(&entry.chunkstore_path),
                chunkstore_capacity: entry.chunkstore_capacity,
                client_port: 0,
                vault_port: 0,
                requested_to_run: entry.requested_to_run,
                vault_requested: false,
                rendezvous: Arc::new(Rendezvous::default()),
            });
        }
    }

    fn stop_vault(&self, request: &rpc::StopVaultRequest) -> bool {
        let process_index;
        {
            let mut vaults = self.vaults.lock().unwrap();
            let Some(record) = vaults
                .iter_mut()
                .find(|record| record.keys.identity == request.identity)
            else {
                warn!("stop request for unknown vault identity");
                return false;
            };
            let Some(key) = record.keys.verifying_key() else {
                warn!("stored vault key is unusable");
                return false;
            };
            let proof = SignedData {
                data: request.data.clone(),
                signature: request.signature.clone(),
            };
            if !proof.verify(&key) {
                warn!(
                    client_port = record.client_port,
                    "stop request failed signature verification"
                );
                return false;
            }
            record.requested_to_run = false;
            process_index = record.process_index;
        }
        self.process_control.stop_process(process_index);
        self.write_config();
        true
    }

    fn write_config(&self) {
        let config = {
            let vaults = self.vaults.lock().unwrap();
            SupervisorConfig {
                update_interval_secs: self.update_interval.lock().unwrap().as_secs(),
                vaults: vaults.iter().map(VaultRecord::to_entry).collect(),
            }
        };
        if let Err(err) = config.save(&self.config_path) {
            warn!("failed to persist config: {err:#}");
        }
    }

    fn check_for_updates(&self) {
        let dir = self.config_dir();
        debug!("checking for updates");
        match self.downloader.update_and_verify(BOOTSTRAP_GLOBAL, dir) {
            Ok(Some(_)) => debug!("bootstrap contacts refreshed"),
            Ok(None) => {}
            Err(err) => warn!("failed to refresh {BOOTSTRAP_GLOBAL}: {err:#}"),
        }
        for application in update::APPLICATIONS {
            let latest = update::find_latest_local_version(dir, application);
            match self.downloader.update_and_verify(&latest, dir) {
                Ok(Some(updated)) => {
                    info!("downloaded {updated}");
                    #[cfg(unix)]
                    update::refresh_symlink(application, &dir.join(&updated));
                }
                Ok(None) => debug!("no newer {application} available"),
                Err(err) => warn!("update check for {application} failed: {err:#}"),
            }
        }
    }
}
