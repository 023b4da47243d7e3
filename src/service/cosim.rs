//! Co-simulation coordinator: groups of sessions driven together.
//!
//! Three synchronization schemes are offered. Step fans out an
//! instruction count serially and swallows per-member errors, since not
//! every backend can step. Time-slice fans out a wall-clock advance in
//! parallel, one task per member, because the resume/sleep/pause
//! approximation used by some backends would otherwise multiply total
//! wall time by member count; the first reported error wins and siblings
//! are not cancelled. Event injection targets a single member.
//!
//! The step-to-virtual-time mapping (1 µs per step) is a placeholder the
//! backends do not validate; tests pin the formula.

use super::SessionService;
use crate::error::{Error, Resource, Result};
use crate::model::{
    CosimMember, CosimMemberSpec, CosimSession, CosimStatus, Feature, InjectEvent, MemberStatus,
};
use chrono::Utc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Virtual nanoseconds credited per instruction step.
const STEP_TIME_NS: u64 = 1_000;

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

impl SessionService {
    /// Create a co-simulation group from member specifications.
    pub async fn create_cosim(&self, specs: Vec<CosimMemberSpec>) -> Result<CosimSession> {
        let cosim_id = format!("cosim_{}", short_id());
        let members = specs
            .into_iter()
            .map(|spec| CosimMember {
                id: format!("member_{}", short_id()),
                cosim_id: cosim_id.clone(),
                backend: spec.backend,
                session_id: spec.session_id,
                config: spec.config,
                status: MemberStatus::Initialized,
            })
            .collect();

        let session = CosimSession {
            id: cosim_id,
            status: CosimStatus::Created,
            created_at: Utc::now(),
            started_at: None,
            sync_count: 0,
            time_ns: 0,
            members,
        };

        self.store.put_cosim(&session).await?;
        info!(cosim_id = %session.id, members = session.members.len(), "co-simulation created");
        Ok(session)
    }

    pub async fn get_cosim(&self, cosim_id: &str) -> Result<CosimSession> {
        self.store
            .get_cosim(cosim_id)
            .await?
            .ok_or_else(|| Error::NotFound(Resource::CosimSession, cosim_id.to_string()))
    }

    pub async fn list_cosim(
        &self,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<CosimSession>, u64)> {
        self.store.list_cosim(page, page_size).await
    }

    /// Mark the group running. Member sessions are not powered on
    /// implicitly.
    pub async fn start_cosim(&self, cosim_id: &str) -> Result<CosimSession> {
        let mut group = self.get_cosim(cosim_id).await?;
        group.status = CosimStatus::Running;
        group.started_at = Some(Utc::now());
        self.store.put_cosim(&group).await?;
        Ok(group)
    }

    pub async fn stop_cosim(&self, cosim_id: &str) -> Result<CosimSession> {
        let mut group = self.get_cosim(cosim_id).await?;
        group.status = CosimStatus::Stopped;
        self.store.put_cosim(&group).await?;
        Ok(group)
    }

    pub async fn delete_cosim(&self, cosim_id: &str) -> Result<()> {
        let group = self.get_cosim(cosim_id).await?;
        if group.status == CosimStatus::Running {
            let _ = self.stop_cosim(cosim_id).await;
        }
        self.store.delete_cosim(cosim_id).await
    }

    /// Instruction fan-out: step every member with a bound live session.
    ///
    /// Dispatch is serial and best-effort; members whose backend cannot
    /// step, whose session is gone, or whose step call fails are skipped.
    /// Counters advance once per call, not per member.
    pub async fn sync_step(&self, cosim_id: &str, steps: u64) -> Result<CosimSession> {
        let mut group = self.get_cosim(cosim_id).await?;
        if group.status != CosimStatus::Running {
            return Err(Error::NotRunning(cosim_id.to_string()));
        }

        for member in &group.members {
            let Some(session_id) = member.session_id.as_deref() else {
                continue;
            };
            let Some(session) = self.live_session(session_id).await else {
                continue;
            };
            let Ok(adapter) = self.adapter(session.backend) else {
                continue;
            };
            if !adapter.capabilities().supports(Feature::Step) {
                debug!(member_id = %member.id, backend = %session.backend, "member cannot step; skipping");
                continue;
            }
            if let Err(err) = adapter.step(session_id, steps).await {
                debug!(member_id = %member.id, %err, "step dispatch failed; continuing");
            }
        }

        group.sync_count += steps;
        group.time_ns += steps * STEP_TIME_NS;
        self.store.put_cosim(&group).await?;
        Ok(group)
    }

    /// Time-slice fan-out: advance every member by the same wall-clock
    /// span, in parallel. Members whose backend does not advertise time
    /// advance are skipped, like members that cannot step. All tasks run
    /// to completion; the first error observed is returned and the time
    /// counter is only credited on full success.
    pub async fn sync_time(
        &self,
        cosim_id: &str,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<CosimSession> {
        let mut group = self.get_cosim(cosim_id).await?;
        if group.status != CosimStatus::Running {
            return Err(Error::NotRunning(cosim_id.to_string()));
        }

        let mut tasks = JoinSet::new();
        for member in &group.members {
            let Some(session_id) = member.session_id.clone() else {
                continue;
            };
            let Some(session) = self.live_session(&session_id).await else {
                continue;
            };
            let Ok(adapter) = self.adapter(session.backend) else {
                continue;
            };
            if !adapter.capabilities().supports(Feature::TimeAdvance) {
                debug!(member_id = %member.id, backend = %session.backend, "member cannot advance time; skipping");
                continue;
            }
            let cancel = cancel.clone();
            tasks.spawn(async move { adapter.run_for(&session_id, duration, &cancel).await });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined
                .unwrap_or_else(|e| Err(Error::Internal(format!("time-slice task failed: {e}"))));
            if let Err(err) = result {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        group.time_ns += duration.as_nanos() as u64;
        self.store.put_cosim(&group).await?;
        Ok(group)
    }

    /// Targeted event injection into a single member's bound session.
    pub async fn inject_cosim_event(
        &self,
        cosim_id: &str,
        member_id: &str,
        event: &InjectEvent,
    ) -> Result<()> {
        let group = self.get_cosim(cosim_id).await?;
        let member = group
            .members
            .iter()
            .find(|m| m.id == member_id)
            .ok_or_else(|| Error::NotFound(Resource::CosimMember, member_id.to_string()))?;

        let session_id = member.session_id.as_deref().ok_or_else(|| {
            Error::NotFound(
                Resource::Session,
                format!("member {member_id} has no bound session"),
            )
        })?;
        let session = self
            .live_session(session_id)
            .await
            .ok_or_else(|| Error::session_not_found(session_id))?;

        let adapter = self.adapter(session.backend)?;
        Self::require_feature(adapter.as_ref(), Feature::EventInjection, "inject_event")?;
        adapter.inject_event(session_id, event).await
    }
}
