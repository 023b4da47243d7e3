//! Shared test doubles: a counting mock adapter and a fault-injecting
//! store wrapper.

use crate::adapter::BackendAdapter;
use crate::config::Config;
use crate::console::ConsoleSink;
use crate::error::{Error, Result};
use crate::model::{
    AuditRecord, Backend, BoardConfig, Capability, CosimSession, Feature, InjectEvent, Program,
    SessionRecord, Snapshot,
};
use crate::service::SessionService;
use crate::store::{MemStore, Store};
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Adapter double that records every call and always succeeds.
pub(crate) struct MockAdapter {
    backend: Backend,
    features: Vec<Feature>,
    next_port: AtomicU16,
    pub start_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
    pub reset_calls: AtomicUsize,
    pub execute_calls: AtomicUsize,
    pub pause_calls: AtomicUsize,
    pub resume_calls: AtomicUsize,
    pub load_calls: AtomicUsize,
    pub snapshot_calls: AtomicUsize,
    pub restore_calls: AtomicUsize,
    pub step_calls: AtomicUsize,
    pub run_for_calls: AtomicUsize,
    pub inject_calls: AtomicUsize,
    /// When set, run_for sleeps for the requested span so parallelism is
    /// observable through wall-clock time.
    pub sleep_in_run_for: AtomicBool,
    /// When set, run-state commands fail with a transport error.
    pub fail_run_state: AtomicBool,
    /// Session id and payload of the most recent injected event.
    pub last_injected: Mutex<Option<(String, InjectEvent)>>,
}

impl MockAdapter {
    pub fn new(backend: Backend) -> Arc<Self> {
        Self::with_features(
            backend,
            vec![
                Feature::GdbServer,
                Feature::Monitor,
                Feature::Snapshot,
                Feature::Step,
                Feature::Coverage,
                Feature::TimeAdvance,
                Feature::EventInjection,
            ],
        )
    }

    fn run_state_result(&self) -> Result<()> {
        if self.fail_run_state.load(Ordering::SeqCst) {
            return Err(Error::Transport("monitor write failed".to_string()));
        }
        Ok(())
    }

    pub fn with_features(backend: Backend, features: Vec<Feature>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            features,
            next_port: AtomicU16::new(40_000),
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            reset_calls: AtomicUsize::new(0),
            execute_calls: AtomicUsize::new(0),
            pause_calls: AtomicUsize::new(0),
            resume_calls: AtomicUsize::new(0),
            load_calls: AtomicUsize::new(0),
            snapshot_calls: AtomicUsize::new(0),
            restore_calls: AtomicUsize::new(0),
            step_calls: AtomicUsize::new(0),
            run_for_calls: AtomicUsize::new(0),
            inject_calls: AtomicUsize::new(0),
            sleep_in_run_for: AtomicBool::new(false),
            fail_run_state: AtomicBool::new(false),
            last_injected: Mutex::new(None),
        })
    }
}

#[async_trait]
impl BackendAdapter for MockAdapter {
    fn capabilities(&self) -> Capability {
        Capability {
            backend: self.backend,
            processors: vec!["mock".to_string()],
            peripherals: Vec::new(),
            bus_types: Vec::new(),
            features: self.features.clone(),
            boards: vec!["test-board".to_string()],
        }
    }

    async fn start_session(
        &self,
        session: &mut SessionRecord,
        _config: &BoardConfig,
        _console: Option<ConsoleSink>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        session.gdb_port = self.next_port.fetch_add(2, Ordering::SeqCst);
        session.monitor_port = session.gdb_port + 1;
        session.pid = 4242;
        Ok(())
    }

    async fn stop_session(&self, _session_id: &str) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reset_session(&self, _session_id: &str) -> Result<()> {
        self.reset_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load_program(&self, _session_id: &str, _program_path: &Path) -> Result<()> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn execute(&self, _session_id: &str) -> Result<()> {
        self.execute_calls.fetch_add(1, Ordering::SeqCst);
        self.run_state_result()
    }

    async fn pause(&self, _session_id: &str) -> Result<()> {
        self.pause_calls.fetch_add(1, Ordering::SeqCst);
        self.run_state_result()
    }

    async fn resume(&self, _session_id: &str) -> Result<()> {
        self.resume_calls.fetch_add(1, Ordering::SeqCst);
        self.run_state_result()
    }

    async fn gdb_port(&self, _session_id: &str) -> Result<u16> {
        Ok(self.next_port.load(Ordering::SeqCst).saturating_sub(2))
    }

    async fn create_snapshot(&self, _session_id: &str, _snapshot_path: &Path) -> Result<()> {
        self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn restore_snapshot(&self, _session_id: &str, _snapshot_path: &Path) -> Result<()> {
        self.restore_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn step(&self, _session_id: &str, _steps: u64) -> Result<()> {
        self.step_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn start_coverage(&self, _session_id: &str, _output_path: &Path) -> Result<()> {
        Ok(())
    }

    async fn stop_coverage(&self, _session_id: &str) -> Result<()> {
        Ok(())
    }

    async fn run_for(
        &self,
        _session_id: &str,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.run_for_calls.fetch_add(1, Ordering::SeqCst);
        if self.sleep_in_run_for.load(Ordering::SeqCst) {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {}
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
        Ok(())
    }

    async fn inject_event(&self, session_id: &str, event: &InjectEvent) -> Result<()> {
        self.inject_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_injected.lock().unwrap() = Some((session_id.to_string(), event.clone()));
        Ok(())
    }
}

/// Store wrapper that fails selected operations with a persist error.
pub(crate) struct FailingStore {
    inner: MemStore,
    fail_session_puts: bool,
}

impl FailingStore {
    pub fn fail_session_puts() -> Self {
        Self {
            inner: MemStore::new(),
            fail_session_puts: true,
        }
    }
}

#[async_trait]
impl Store for FailingStore {
    async fn put_session(&self, record: &SessionRecord) -> Result<()> {
        if self.fail_session_puts {
            return Err(Error::Persist("session write rejected".to_string()));
        }
        self.inner.put_session(record).await
    }

    async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>> {
        self.inner.get_session(id).await
    }

    async fn list_sessions(
        &self,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<SessionRecord>, u64)> {
        self.inner.list_sessions(page, page_size).await
    }

    async fn delete_session(&self, id: &str) -> Result<()> {
        self.inner.delete_session(id).await
    }

    async fn put_program(&self, program: &Program) -> Result<()> {
        self.inner.put_program(program).await
    }

    async fn get_program(&self, id: &str) -> Result<Option<Program>> {
        self.inner.get_program(id).await
    }

    async fn delete_program(&self, id: &str) -> Result<()> {
        self.inner.delete_program(id).await
    }

    async fn put_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.inner.put_snapshot(snapshot).await
    }

    async fn get_snapshot(&self, id: &str) -> Result<Option<Snapshot>> {
        self.inner.get_snapshot(id).await
    }

    async fn put_cosim(&self, session: &CosimSession) -> Result<()> {
        self.inner.put_cosim(session).await
    }

    async fn get_cosim(&self, id: &str) -> Result<Option<CosimSession>> {
        self.inner.get_cosim(id).await
    }

    async fn list_cosim(&self, page: u32, page_size: u32) -> Result<(Vec<CosimSession>, u64)> {
        self.inner.list_cosim(page, page_size).await
    }

    async fn delete_cosim(&self, id: &str) -> Result<()> {
        self.inner.delete_cosim(id).await
    }

    async fn append_audit(&self, record: &AuditRecord) -> Result<()> {
        self.inner.append_audit(record).await
    }
}

/// A service over a fresh temp storage root, a mem store and a mock
/// adapter registered for the qemu tag.
pub(crate) async fn service_with_mock(
    max_sessions: usize,
) -> (SessionService, Arc<MockAdapter>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("temp storage root");
    let mut config = Config::default();
    config.resources.max_sessions = max_sessions;
    config.storage.base_path = dir.path().to_path_buf();

    let mut service =
        SessionService::new(config, Arc::new(MemStore::new()), None).expect("service");
    let mock = MockAdapter::new(Backend::Qemu);
    service.register_adapter(mock.clone());

    (service, mock, dir)
}
