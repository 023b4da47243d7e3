//! Session service: composes adapters, the durable store and the console
//! fan-out behind the control API.
//!
//! The durable store is authoritative; the in-memory index is a
//! write-through cache holding the live runtime view (ports, pid, child
//! liveness). Reads hit the cache first and fall back to the store, and
//! the two agree on identifier and state at every commit point.
//!
//! Creation uses a two-phase pattern so the session cap is enforced
//! without holding the index lock across the adapter's (slow) child
//! spawn: reserve a slot under the lock, start the child unlocked, then
//! insert on success or release the reservation on failure.

mod cosim;

use crate::adapter::{BackendAdapter, OpenocdAdapter, QemuAdapter, RenodeAdapter};
use crate::config::Config;
use crate::console::ConsoleHub;
use crate::error::{Error, Resource, Result};
use crate::model::{
    AuditRecord, Backend, BoardConfig, Capability, Feature, Program, ProgramFormat,
    SessionRecord, SessionState, Snapshot,
};
use crate::store::Store;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

const PROGRAMS_DIR: &str = "programs";
const SNAPSHOTS_DIR: &str = "snapshots";
const COVERAGE_DIR: &str = "coverage";

#[derive(Default)]
struct Index {
    /// Sessions with a live child, keyed by identifier.
    live: HashMap<String, SessionRecord>,
    /// Create slots taken but not yet inserted; counts against the cap.
    reserved: usize,
}

/// The control core's orchestrator.
pub struct SessionService {
    config: Config,
    store: Arc<dyn Store>,
    adapters: HashMap<Backend, Arc<dyn BackendAdapter>>,
    hub: Option<ConsoleHub>,
    index: RwLock<Index>,
}

impl SessionService {
    /// Build the service, create the storage layout and register an
    /// adapter for every backend enabled in the configuration.
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        hub: Option<ConsoleHub>,
    ) -> Result<Self> {
        for dir in [
            config.storage.base_path.clone(),
            config.storage.base_path.join(PROGRAMS_DIR),
            config.storage.base_path.join(SNAPSHOTS_DIR),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                Error::Internal(format!(
                    "failed to create storage directory {}: {e}",
                    dir.display()
                ))
            })?;
        }

        let mut adapters: HashMap<Backend, Arc<dyn BackendAdapter>> = HashMap::new();
        if config.backends.qemu.enabled {
            adapters.insert(
                Backend::Qemu,
                Arc::new(QemuAdapter::new(config.backends.qemu.binary.clone())),
            );
        }
        if config.backends.renode.enabled {
            adapters.insert(
                Backend::Renode,
                Arc::new(RenodeAdapter::new(config.backends.renode.binary.clone())),
            );
        }
        if config.backends.openocd.enabled {
            adapters.insert(
                Backend::Openocd,
                Arc::new(OpenocdAdapter::new(config.backends.openocd.binary.clone())),
            );
        }

        Ok(Self {
            config,
            store,
            adapters,
            hub,
            index: RwLock::new(Index::default()),
        })
    }

    /// Register (or replace) a backend adapter.
    pub fn register_adapter(&mut self, adapter: Arc<dyn BackendAdapter>) {
        let backend = adapter.capabilities().backend;
        self.adapters.insert(backend, adapter);
    }

    fn adapter(&self, backend: Backend) -> Result<Arc<dyn BackendAdapter>> {
        self.adapters
            .get(&backend)
            .cloned()
            .ok_or(Error::BackendUnknown(backend))
    }

    /// Consult the capability descriptor before dispatch so unsupported
    /// operations fail at the boundary instead of deep in a monitor call.
    fn require_feature(
        adapter: &dyn BackendAdapter,
        feature: Feature,
        operation: &'static str,
    ) -> Result<()> {
        let caps = adapter.capabilities();
        if caps.supports(feature) {
            Ok(())
        } else {
            Err(Error::Unsupported {
                backend: caps.backend,
                operation,
            })
        }
    }

    /// Capability descriptors for every registered backend, in a stable
    /// order.
    pub fn capabilities(&self) -> Vec<Capability> {
        [Backend::Qemu, Backend::Renode, Backend::Openocd]
            .into_iter()
            .filter_map(|b| self.adapters.get(&b))
            .map(|a| a.capabilities())
            .collect()
    }

    /// Create a session: reserve a cap slot, spawn the child, commit the
    /// durable record and insert it into the live index.
    pub async fn create_session(
        &self,
        name: &str,
        backend: Backend,
        board_config: &BoardConfig,
        cancel: &CancellationToken,
    ) -> Result<SessionRecord> {
        let adapter = self.adapter(backend)?;

        {
            let mut index = self.index.write().await;
            let max = self.config.resources.max_sessions;
            if index.live.len() + index.reserved >= max {
                return Err(Error::CapacityExhausted(max));
            }
            index.reserved += 1;
        }

        let outcome = self
            .start_reserved(adapter.as_ref(), name, backend, board_config, cancel)
            .await;

        let mut index = self.index.write().await;
        index.reserved -= 1;
        match outcome {
            Ok(record) => {
                index.live.insert(record.id.clone(), record.clone());
                Ok(record)
            }
            Err(err) => Err(err),
        }
    }

    async fn start_reserved(
        &self,
        adapter: &dyn BackendAdapter,
        name: &str,
        backend: Backend,
        board_config: &BoardConfig,
        cancel: &CancellationToken,
    ) -> Result<SessionRecord> {
        let blob = serde_json::to_string(board_config)
            .map_err(|e| Error::Internal(format!("failed to serialize board config: {e}")))?;

        let now = Utc::now();
        let mut record = SessionRecord {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            backend,
            board_config: blob,
            state: SessionState::Created,
            gdb_port: 0,
            monitor_port: 0,
            pid: 0,
            created_at: now,
            updated_at: now,
            user_id: None,
        };

        let console = self.hub.as_ref().map(|h| h.sink(&record.id));
        adapter
            .start_session(&mut record, board_config, console, cancel)
            .await?;

        record.state = SessionState::Running;
        record.updated_at = Utc::now();

        if let Err(persist_err) = self.store.put_session(&record).await {
            // The child is already running; compensate before surfacing
            // the original error.
            if let Err(stop_err) = adapter.stop_session(&record.id).await {
                warn!(
                    session_id = %record.id,
                    %stop_err,
                    "compensating stop failed after persist error"
                );
            }
            return Err(persist_err);
        }

        info!(
            session_id = %record.id,
            backend = %backend,
            gdb_port = record.gdb_port,
            monitor_port = record.monitor_port,
            "session created"
        );
        Ok(record)
    }

    /// Fetch a session, live index first, durable store as fallback.
    pub async fn get_session(&self, session_id: &str) -> Result<SessionRecord> {
        {
            let index = self.index.read().await;
            if let Some(record) = index.live.get(session_id) {
                return Ok(record.clone());
            }
        }
        self.store
            .get_session(session_id)
            .await?
            .ok_or_else(|| Error::session_not_found(session_id))
    }

    /// Live-only lookup used by the co-simulation coordinator.
    pub(crate) async fn live_session(&self, session_id: &str) -> Option<SessionRecord> {
        self.index.read().await.live.get(session_id).cloned()
    }

    /// Paginated listing straight from the authoritative store.
    pub async fn list_sessions(
        &self,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<SessionRecord>, u64)> {
        self.store.list_sessions(page, page_size).await
    }

    /// Stop the child (when live) and delete the durable record. A stop
    /// failure leaves the session in place and is surfaced.
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        let live = self.index.read().await.live.get(session_id).cloned();
        if let Some(record) = live {
            let adapter = self.adapter(record.backend)?;
            adapter.stop_session(session_id).await?;
            self.index.write().await.live.remove(session_id);
        }

        self.store.delete_session(session_id).await?;
        info!(session_id, "session deleted");
        Ok(())
    }

    /// Commit a state change: store first, then the live index.
    async fn set_state(&self, session_id: &str, state: SessionState) -> Result<SessionRecord> {
        let mut record = self.get_session(session_id).await?;
        record.state = state;
        record.updated_at = Utc::now();
        self.store.put_session(&record).await?;

        let mut index = self.index.write().await;
        if let Some(live) = index.live.get_mut(session_id) {
            live.state = record.state;
            live.updated_at = record.updated_at;
        }
        Ok(record)
    }

    /// Best-effort transition to the Error state after an adapter
    /// reported a fatal failure; the original error is what callers see.
    async fn mark_error(&self, session_id: &str) {
        if let Err(err) = self.set_state(session_id, SessionState::Error).await {
            warn!(session_id, %err, "failed to record error state");
        }
    }

    pub async fn power_on(&self, session_id: &str) -> Result<SessionRecord> {
        let session = self.get_session(session_id).await?;
        if let Err(err) = self.adapter(session.backend)?.execute(session_id).await {
            self.mark_error(session_id).await;
            return Err(err);
        }
        self.set_state(session_id, SessionState::Running).await
    }

    pub async fn power_off(&self, session_id: &str) -> Result<SessionRecord> {
        let session = self.get_session(session_id).await?;
        if let Err(err) = self.adapter(session.backend)?.pause(session_id).await {
            self.mark_error(session_id).await;
            return Err(err);
        }
        self.set_state(session_id, SessionState::Stopped).await
    }

    pub async fn pause_session(&self, session_id: &str) -> Result<SessionRecord> {
        let session = self.get_session(session_id).await?;
        if let Err(err) = self.adapter(session.backend)?.pause(session_id).await {
            self.mark_error(session_id).await;
            return Err(err);
        }
        self.set_state(session_id, SessionState::Paused).await
    }

    pub async fn resume_session(&self, session_id: &str) -> Result<SessionRecord> {
        let session = self.get_session(session_id).await?;
        if let Err(err) = self.adapter(session.backend)?.resume(session_id).await {
            self.mark_error(session_id).await;
            return Err(err);
        }
        self.set_state(session_id, SessionState::Running).await
    }

    pub async fn reset_session(&self, session_id: &str) -> Result<()> {
        let session = self.get_session(session_id).await?;
        self.adapter(session.backend)?
            .reset_session(session_id)
            .await
    }

    /// Debug-bridge port of a live session.
    pub async fn debug_port(&self, session_id: &str) -> Result<u16> {
        let session = self.get_session(session_id).await?;
        self.adapter(session.backend)?.gdb_port(session_id).await
    }

    /// Stream a firmware image into the content-addressed program store.
    pub async fn upload_program<R>(
        &self,
        name: &str,
        format: ProgramFormat,
        reader: &mut R,
    ) -> Result<Program>
    where
        R: AsyncRead + Unpin + Send,
    {
        let id = Uuid::new_v4().to_string();
        let dir = self.config.storage.base_path.join(PROGRAMS_DIR);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Persist(format!("failed to create programs dir: {e}")))?;
        let path = dir.join(&id);

        let (size, hash) = match copy_hashing(reader, &path).await {
            Ok(done) => done,
            Err(e) => {
                let _ = tokio::fs::remove_file(&path).await;
                return Err(Error::Persist(format!("failed to write program: {e}")));
            }
        };

        let program = Program {
            id,
            name: name.to_string(),
            format,
            size,
            path: path.clone(),
            hash,
            created_at: Utc::now(),
            user_id: None,
        };

        if let Err(persist_err) = self.store.put_program(&program).await {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(persist_err);
        }

        info!(program_id = %program.id, size, "program uploaded");
        Ok(program)
    }

    /// Load a previously uploaded program into a session.
    pub async fn load_program(&self, session_id: &str, program_id: &str) -> Result<()> {
        let session = self.get_session(session_id).await?;
        let adapter = self.adapter(session.backend)?;
        let program = self
            .store
            .get_program(program_id)
            .await?
            .ok_or_else(|| Error::NotFound(Resource::Program, program_id.to_string()))?;
        adapter.load_program(session_id, &program.path).await
    }

    /// Capture target state into a new snapshot record.
    pub async fn create_snapshot(
        &self,
        session_id: &str,
        name: &str,
        description: &str,
    ) -> Result<Snapshot> {
        let session = self.get_session(session_id).await?;
        let adapter = self.adapter(session.backend)?;
        Self::require_feature(adapter.as_ref(), Feature::Snapshot, "create_snapshot")?;

        let id = Uuid::new_v4().to_string();
        let dir = self.config.storage.base_path.join(SNAPSHOTS_DIR);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Persist(format!("failed to create snapshots dir: {e}")))?;
        let path = dir.join(&id);

        adapter.create_snapshot(session_id, &path).await?;

        let snapshot = Snapshot {
            id,
            session_id: session_id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            path: path.clone(),
            created_at: Utc::now(),
        };

        if let Err(persist_err) = self.store.put_snapshot(&snapshot).await {
            // The backend already wrote the file; take it back out.
            let _ = tokio::fs::remove_file(&path).await;
            return Err(persist_err);
        }

        Ok(snapshot)
    }

    pub async fn restore_snapshot(&self, session_id: &str, snapshot_id: &str) -> Result<()> {
        let session = self.get_session(session_id).await?;
        let adapter = self.adapter(session.backend)?;
        Self::require_feature(adapter.as_ref(), Feature::Snapshot, "restore_snapshot")?;

        let snapshot = self
            .store
            .get_snapshot(snapshot_id)
            .await?
            .ok_or_else(|| Error::NotFound(Resource::Snapshot, snapshot_id.to_string()))?;
        adapter.restore_snapshot(session_id, &snapshot.path).await
    }

    /// Begin coverage collection to `coverage/<session-id>.trace`.
    pub async fn start_coverage(&self, session_id: &str) -> Result<PathBuf> {
        let session = self.get_session(session_id).await?;
        let adapter = self.adapter(session.backend)?;
        Self::require_feature(adapter.as_ref(), Feature::Coverage, "start_coverage")?;

        let dir = self.config.storage.base_path.join(COVERAGE_DIR);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Persist(format!("failed to create coverage dir: {e}")))?;
        let output = dir.join(format!("{session_id}.trace"));

        adapter.start_coverage(session_id, &output).await?;
        Ok(output)
    }

    pub async fn stop_coverage(&self, session_id: &str) -> Result<()> {
        let session = self.get_session(session_id).await?;
        let adapter = self.adapter(session.backend)?;
        Self::require_feature(adapter.as_ref(), Feature::Coverage, "stop_coverage")?;
        adapter.stop_coverage(session_id).await
    }

    /// Append a control-plane audit trace.
    pub async fn log_audit(
        &self,
        user_id: &str,
        action: &str,
        resource: &str,
        details: &str,
        ip: &str,
    ) -> Result<()> {
        self.store
            .append_audit(&AuditRecord {
                user_id: user_id.to_string(),
                action: action.to_string(),
                resource: resource.to_string(),
                details: details.to_string(),
                ip: ip.to_string(),
                timestamp: Utc::now(),
            })
            .await
    }

    /// Stop every live session; used on graceful shutdown.
    pub async fn shutdown_all(&self) {
        let live: Vec<(String, Backend)> = {
            let index = self.index.read().await;
            index
                .live
                .values()
                .map(|r| (r.id.clone(), r.backend))
                .collect()
        };

        for (session_id, backend) in live {
            if let Ok(adapter) = self.adapter(backend) {
                if let Err(err) = adapter.stop_session(&session_id).await {
                    warn!(%session_id, %err, "failed to stop session during shutdown");
                }
            }
            self.index.write().await.live.remove(&session_id);
            if let Ok(Some(mut record)) = self.store.get_session(&session_id).await {
                record.state = SessionState::Stopped;
                record.updated_at = Utc::now();
                let _ = self.store.put_session(&record).await;
            }
        }
    }
}

/// Stream `reader` into a file at `path`, hashing as it goes.
async fn copy_hashing<R>(reader: &mut R, path: &std::path::Path) -> std::io::Result<(u64, String)>
where
    R: AsyncRead + Unpin + Send,
{
    let mut file = tokio::fs::File::create(path).await?;
    let mut hasher = Sha256::new();
    let mut size: u64 = 0;
    let mut buf = vec![0u8; 8192];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        file.write_all(&buf[..n]).await?;
        size += n as u64;
    }
    file.flush().await?;

    Ok((size, hex::encode(hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use crate::testing::{service_with_mock, MockAdapter};
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn capacity_cap_rejects_the_second_create() {
        let (service, mock, _dir) = service_with_mock(1).await;
        let cancel = CancellationToken::new();

        service
            .create_session("A", Backend::Qemu, &BoardConfig::default(), &cancel)
            .await
            .unwrap();

        let err = service
            .create_session("B", Backend::Qemu, &BoardConfig::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CapacityExhausted(1)));
        assert_eq!(mock.start_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn board_config_round_trips_through_the_record() {
        let (service, _mock, _dir) = service_with_mock(10).await;
        let cancel = CancellationToken::new();

        let config = BoardConfig {
            board: Some("test-board".to_string()),
            ..Default::default()
        };
        let created = service
            .create_session("round-trip", Backend::Qemu, &config, &cancel)
            .await
            .unwrap();

        let fetched = service.get_session(&created.id).await.unwrap();
        let decoded: BoardConfig = serde_json::from_str(&fetched.board_config).unwrap();
        assert_eq!(decoded.board.as_deref(), Some("test-board"));
        assert_eq!(decoded, config);
        assert_eq!(fetched.state, SessionState::Running);
    }

    #[tokio::test]
    async fn live_ports_are_nonzero_and_distinct() {
        let (service, _mock, _dir) = service_with_mock(10).await;
        let cancel = CancellationToken::new();

        let a = service
            .create_session("a", Backend::Qemu, &BoardConfig::default(), &cancel)
            .await
            .unwrap();
        let b = service
            .create_session("b", Backend::Qemu, &BoardConfig::default(), &cancel)
            .await
            .unwrap();

        for rec in [&a, &b] {
            assert_ne!(rec.gdb_port, 0);
            assert_ne!(rec.monitor_port, 0);
        }
        let ports = [a.gdb_port, a.monitor_port, b.gdb_port, b.monitor_port];
        for (i, p) in ports.iter().enumerate() {
            for q in &ports[i + 1..] {
                assert_ne!(p, q);
            }
        }
    }

    #[tokio::test]
    async fn power_calls_forward_to_the_adapter() {
        let (service, mock, _dir) = service_with_mock(10).await;
        let cancel = CancellationToken::new();

        let session = service
            .create_session("pwr", Backend::Qemu, &BoardConfig::default(), &cancel)
            .await
            .unwrap();

        let on = service.power_on(&session.id).await.unwrap();
        assert_eq!(mock.execute_calls.load(Ordering::SeqCst), 1);
        assert_eq!(on.state, SessionState::Running);

        let off = service.power_off(&session.id).await.unwrap();
        assert_eq!(mock.pause_calls.load(Ordering::SeqCst), 1);
        assert_eq!(off.state, SessionState::Stopped);

        service.reset_session(&session.id).await.unwrap();
        assert_eq!(mock.reset_calls.load(Ordering::SeqCst), 1);

        let paused = service.pause_session(&session.id).await.unwrap();
        assert_eq!(paused.state, SessionState::Paused);
        let resumed = service.resume_session(&session.id).await.unwrap();
        assert_eq!(resumed.state, SessionState::Running);
        assert_eq!(mock.resume_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn adapter_failure_marks_the_session_error() {
        let (service, mock, _dir) = service_with_mock(10).await;
        let session = service
            .create_session(
                "flaky",
                Backend::Qemu,
                &BoardConfig::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        mock.fail_run_state.store(true, Ordering::SeqCst);
        let err = service.power_on(&session.id).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));

        // The fatal failure is recorded in both views of the session.
        let fetched = service.get_session(&session.id).await.unwrap();
        assert_eq!(fetched.state, SessionState::Error);
        let durable = service.list_sessions(1, 10).await.unwrap().0;
        assert_eq!(durable[0].state, SessionState::Error);

        // Deletion is still available to clear the errored session.
        service.delete_session(&session.id).await.unwrap();
        let err = service.get_session(&session.id).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(Resource::Session, _)));
    }

    #[tokio::test]
    async fn delete_cascades_stop_and_clears_both_views() {
        let (service, mock, _dir) = service_with_mock(10).await;
        let cancel = CancellationToken::new();

        let session = service
            .create_session("A", Backend::Qemu, &BoardConfig::default(), &cancel)
            .await
            .unwrap();

        service.delete_session(&session.id).await.unwrap();
        assert!(mock.stop_calls.load(Ordering::SeqCst) >= 1);

        let err = service.get_session(&session.id).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(Resource::Session, _)));

        // The freed slot is usable again.
        service
            .create_session("B", Backend::Qemu, &BoardConfig::default(), &cancel)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn persist_failure_on_create_stops_the_child() {
        use crate::testing::FailingStore;

        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.base_path = dir.path().to_path_buf();

        let store = Arc::new(FailingStore::fail_session_puts());
        let mut service = SessionService::new(config, store, None).unwrap();
        let mock = MockAdapter::new(Backend::Qemu);
        service.register_adapter(mock.clone());

        let err = service
            .create_session(
                "doomed",
                Backend::Qemu,
                &BoardConfig::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Persist(_)));
        // Compensation: the spawned child was stopped again.
        assert_eq!(mock.start_calls.load(Ordering::SeqCst), 1);
        assert_eq!(mock.stop_calls.load(Ordering::SeqCst), 1);
        // The reservation was released.
        let ok = service
            .create_session(
                "still-works",
                Backend::Qemu,
                &BoardConfig::default(),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(ok, Err(Error::Persist(_))));
    }

    #[tokio::test]
    async fn cancelled_create_releases_the_slot() {
        let (service, mock, _dir) = service_with_mock(1).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = service
            .create_session("aborted", Backend::Qemu, &BoardConfig::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(mock.start_calls.load(Ordering::SeqCst), 0);

        // The reservation was released; the cap of one is still usable.
        service
            .create_session(
                "next",
                Backend::Qemu,
                &BoardConfig::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn pull_console_defaults_to_unsupported() {
        let (_service, mock, _dir) = service_with_mock(1).await;

        let err = mock.read_console("any").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Unsupported {
                operation: "read_console",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn unknown_backend_is_rejected_up_front() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.base_path = dir.path().to_path_buf();
        let service =
            SessionService::new(config, Arc::new(MemStore::new()), None).unwrap();

        let err = service
            .create_session(
                "none",
                Backend::Renode,
                &BoardConfig::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BackendUnknown(Backend::Renode)));
    }

    #[tokio::test]
    async fn snapshot_is_gated_by_capability() {
        let (mut service, _mock, _dir) = service_with_mock(10).await;
        // Replace the adapter with one that lacks snapshot support.
        let bare = MockAdapter::with_features(Backend::Qemu, vec![Feature::Coverage]);
        service.register_adapter(bare.clone());

        let session = service
            .create_session(
                "no-snap",
                Backend::Qemu,
                &BoardConfig::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let err = service
            .create_snapshot(&session.id, "s", "")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Unsupported {
                operation: "create_snapshot",
                ..
            }
        ));
        // The adapter itself was never asked.
        assert_eq!(bare.snapshot_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn snapshot_paths_live_under_the_snapshots_dir() {
        let (service, mock, dir) = service_with_mock(10).await;
        let session = service
            .create_session(
                "snap",
                Backend::Qemu,
                &BoardConfig::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let snapshot = service
            .create_snapshot(&session.id, "before-boot", "initial state")
            .await
            .unwrap();
        assert_eq!(mock.snapshot_calls.load(Ordering::SeqCst), 1);
        assert!(snapshot.path.starts_with(dir.path().join(SNAPSHOTS_DIR)));
        assert_eq!(snapshot.session_id, session.id);

        service
            .restore_snapshot(&session.id, &snapshot.id)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn program_upload_hashes_and_loads() {
        let (service, mock, dir) = service_with_mock(10).await;

        let firmware = b"not really an elf".to_vec();
        let mut reader = std::io::Cursor::new(firmware.clone());
        let program = service
            .upload_program("blinky", ProgramFormat::Elf, &mut reader)
            .await
            .unwrap();

        assert_eq!(program.size, firmware.len() as u64);
        let expected = hex::encode(Sha256::digest(&firmware));
        assert_eq!(program.hash, expected);
        assert!(program.path.starts_with(dir.path().join(PROGRAMS_DIR)));
        assert_eq!(
            tokio::fs::read(&program.path).await.unwrap(),
            firmware
        );

        let session = service
            .create_session(
                "loader",
                Backend::Qemu,
                &BoardConfig::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        service.load_program(&session.id, &program.id).await.unwrap();
        assert_eq!(mock.load_calls.load(Ordering::SeqCst), 1);

        let err = service
            .load_program(&session.id, "missing")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(Resource::Program, _)));
    }

    #[tokio::test]
    async fn coverage_output_is_per_session() {
        let (service, _mock, dir) = service_with_mock(10).await;
        let session = service
            .create_session(
                "cov",
                Backend::Qemu,
                &BoardConfig::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let output = service.start_coverage(&session.id).await.unwrap();
        assert_eq!(
            output,
            dir.path()
                .join(COVERAGE_DIR)
                .join(format!("{}.trace", session.id))
        );
        service.stop_coverage(&session.id).await.unwrap();
    }

    #[tokio::test]
    async fn listing_reflects_the_durable_store() {
        let (service, _mock, _dir) = service_with_mock(10).await;
        let cancel = CancellationToken::new();

        for i in 0..3 {
            service
                .create_session(&format!("s{i}"), Backend::Qemu, &BoardConfig::default(), &cancel)
                .await
                .unwrap();
        }

        let (page, total) = service.list_sessions(1, 2).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(page.len(), 2);
    }
}
