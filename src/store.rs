//! Durable record store behind the session service.
//!
//! The relational engine itself is an external collaborator; the core
//! consumes it through the [`Store`] trait. [`MemStore`] is the bundled
//! implementation used by the standalone binary and by tests. List
//! operations paginate with a 1-based page number and return the total
//! count alongside the slice.

use crate::error::Result;
use crate::model::{AuditRecord, CosimSession, Program, SessionRecord, Snapshot};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// Relational handle consumed by the session service. Writes either
/// commit fully or fail with [`Error::Persist`]; the service layers
/// compensation on top.
#[async_trait]
pub trait Store: Send + Sync {
    async fn put_session(&self, record: &SessionRecord) -> Result<()>;
    async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>>;
    async fn list_sessions(&self, page: u32, page_size: u32)
        -> Result<(Vec<SessionRecord>, u64)>;
    async fn delete_session(&self, id: &str) -> Result<()>;

    async fn put_program(&self, program: &Program) -> Result<()>;
    async fn get_program(&self, id: &str) -> Result<Option<Program>>;
    async fn delete_program(&self, id: &str) -> Result<()>;

    async fn put_snapshot(&self, snapshot: &Snapshot) -> Result<()>;
    async fn get_snapshot(&self, id: &str) -> Result<Option<Snapshot>>;

    async fn put_cosim(&self, session: &CosimSession) -> Result<()>;
    async fn get_cosim(&self, id: &str) -> Result<Option<CosimSession>>;
    async fn list_cosim(&self, page: u32, page_size: u32) -> Result<(Vec<CosimSession>, u64)>;
    async fn delete_cosim(&self, id: &str) -> Result<()>;

    async fn append_audit(&self, record: &AuditRecord) -> Result<()>;
}

#[derive(Default)]
struct MemInner {
    sessions: BTreeMap<String, SessionRecord>,
    programs: BTreeMap<String, Program>,
    snapshots: BTreeMap<String, Snapshot>,
    cosim: BTreeMap<String, CosimSession>,
    audit: Vec<AuditRecord>,
}

/// In-memory store with stable (insertion-key ordered) listing.
#[derive(Default)]
pub struct MemStore {
    inner: RwLock<MemInner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn paginate<T: Clone>(map: &BTreeMap<String, T>, page: u32, page_size: u32) -> (Vec<T>, u64) {
    let total = map.len() as u64;
    let page = page.max(1);
    let offset = ((page - 1) * page_size) as usize;
    let slice = map
        .values()
        .skip(offset)
        .take(page_size as usize)
        .cloned()
        .collect();
    (slice, total)
}

#[async_trait]
impl Store for MemStore {
    async fn put_session(&self, record: &SessionRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.sessions.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>> {
        Ok(self.inner.read().await.sessions.get(id).cloned())
    }

    async fn list_sessions(
        &self,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<SessionRecord>, u64)> {
        Ok(paginate(&self.inner.read().await.sessions, page, page_size))
    }

    async fn delete_session(&self, id: &str) -> Result<()> {
        self.inner.write().await.sessions.remove(id);
        Ok(())
    }

    async fn put_program(&self, program: &Program) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.programs.insert(program.id.clone(), program.clone());
        Ok(())
    }

    async fn get_program(&self, id: &str) -> Result<Option<Program>> {
        Ok(self.inner.read().await.programs.get(id).cloned())
    }

    async fn delete_program(&self, id: &str) -> Result<()> {
        self.inner.write().await.programs.remove(id);
        Ok(())
    }

    async fn put_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.snapshots.insert(snapshot.id.clone(), snapshot.clone());
        Ok(())
    }

    async fn get_snapshot(&self, id: &str) -> Result<Option<Snapshot>> {
        Ok(self.inner.read().await.snapshots.get(id).cloned())
    }

    async fn put_cosim(&self, session: &CosimSession) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.cosim.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_cosim(&self, id: &str) -> Result<Option<CosimSession>> {
        Ok(self.inner.read().await.cosim.get(id).cloned())
    }

    async fn list_cosim(&self, page: u32, page_size: u32) -> Result<(Vec<CosimSession>, u64)> {
        Ok(paginate(&self.inner.read().await.cosim, page, page_size))
    }

    async fn delete_cosim(&self, id: &str) -> Result<()> {
        self.inner.write().await.cosim.remove(id);
        Ok(())
    }

    async fn append_audit(&self, record: &AuditRecord) -> Result<()> {
        self.inner.write().await.audit.push(record.clone());
        Ok(())
    }
}
