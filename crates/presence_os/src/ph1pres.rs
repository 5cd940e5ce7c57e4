#![forbid(unsafe_code)]

use tracing::{debug, error, info, warn};

use presence_engines::ph1att::AccumulateOutcome;
use presence_engines::ph1pres::{decide_toggle, policy_for, ToggleDecision};
use presence_kernel_contracts::ph1id::{IdentityResolution, SubjectId, SubjectSummary};
use presence_kernel_contracts::ph1j::{AccessLogAction, AccessLogMetadata, AccessReason};
use presence_kernel_contracts::ph1occ::{AdmissionDecision, ContextId, ContextSummary};
use presence_kernel_contracts::ph1pres::{
    PresenceSessionId, PresenceSessionRecord, ScanOutcome, ScanReceipt, SessionCloseReason,
    ToggleAction,
};
use presence_kernel_contracts::MonotonicTimeNs;
use presence_storage::ph1f::{ContextPartition, StorageError};

use crate::ph1os::{context_summary, PresenceError, PresenceRuntime};

/// Result of one toggle critical section, carried out of the lock for auditing.
#[derive(Debug)]
enum ToggleCommit {
    CheckedIn {
        session: PresenceSessionRecord,
        context: ContextSummary,
        usage: &'static str,
        eligible: Option<bool>,
    },
    CheckedOut(ClosedSession),
    Denied {
        reason: AccessReason,
        context: ContextSummary,
    },
}

#[derive(Debug)]
struct ClosedSession {
    session: PresenceSessionRecord,
    accumulated: AccumulateOutcome,
    context: ContextSummary,
    usage: &'static str,
    tracks_eligibility: bool,
}

impl ClosedSession {
    fn eligible(&self) -> Option<bool> {
        self.tracks_eligibility
            .then_some(self.accumulated.record.is_eligible)
    }

    fn audit_metadata(&self) -> AccessLogMetadata {
        let mut metadata = AccessLogMetadata::empty()
            .with("usage", self.usage)
            .with(
                "duration_minutes",
                self.session.duration_minutes.unwrap_or(0).to_string(),
            )
            .with(
                "total_minutes",
                self.accumulated.record.total_duration_minutes.to_string(),
            );
        if self.accumulated.became_eligible {
            metadata = metadata.with("became_eligible", "true");
        }
        metadata
    }
}

enum ForceCloseStep {
    Closed(ClosedSession),
    AlreadyClosed(SubjectId),
    Missing,
}

impl PresenceRuntime {
    /// Session Toggle Controller entry point.
    ///
    /// Identity is resolved before any lock is taken. Lookup of the ACTIVE session, the
    /// admission check, the session + aggregate writes and the access-log append then run as
    /// one critical section on the context partition, so log order matches commit order.
    pub fn scan(
        &self,
        tag_or_id: &str,
        context_id: &ContextId,
        now: MonotonicTimeNs,
    ) -> Result<ScanReceipt, PresenceError> {
        let subject = match self.identity.resolve(tag_or_id) {
            IdentityResolution::Resolved(subject) => subject,
            IdentityResolution::NotFound => {
                debug!(context_id = %context_id.as_str(), "scan denied: unknown identifier");
                self.record_access(
                    None,
                    context_id,
                    None,
                    AccessLogAction::Denied,
                    Some(AccessReason::UnknownIdentifier),
                    false,
                    now,
                    AccessLogMetadata::empty().with("identifier", tag_or_id),
                );
                return Ok(denied_receipt(
                    AccessReason::UnknownIdentifier,
                    None,
                    self.context_summary(context_id),
                ));
            }
        };
        let subject_summary = SubjectSummary::from(&subject);
        let subject_id = subject.subject_id;

        let commit = self.with_conflict_retry(context_id, now, |p| {
            let commit = self.toggle_locked(p, &subject_id, now)?;
            self.audit_toggle(&commit, &subject_id, context_id, now);
            Ok(commit)
        });
        let commit = match commit {
            Ok(commit) => commit,
            Err(err) => {
                self.record_commit_failure(Some(&subject_id), context_id, None, "scan", &err, now);
                return Err(err);
            }
        };

        let Some(commit) = commit else {
            debug!(
                context_id = %context_id.as_str(),
                subject_id = %subject_id.as_str(),
                "scan denied: unknown context"
            );
            self.record_access(
                Some(subject_id),
                context_id,
                None,
                AccessLogAction::Denied,
                Some(AccessReason::UnknownContext),
                false,
                now,
                AccessLogMetadata::empty(),
            );
            return Ok(denied_receipt(
                AccessReason::UnknownContext,
                Some(subject_summary),
                None,
            ));
        };

        match commit {
            ToggleCommit::CheckedIn {
                session,
                context,
                eligible,
                ..
            } => {
                info!(
                    context_id = %context_id.as_str(),
                    subject_id = %subject_id.as_str(),
                    session_id = session.session_id.0,
                    current_count = context.current_count,
                    "check-in committed"
                );
                Ok(ScanReceipt {
                    outcome: ScanOutcome::Applied {
                        action: ToggleAction::CheckIn,
                        session: session.timing(),
                    },
                    subject: Some(subject_summary),
                    context: Some(context),
                    eligible,
                })
            }
            ToggleCommit::CheckedOut(closed) => {
                info!(
                    context_id = %context_id.as_str(),
                    subject_id = %subject_id.as_str(),
                    session_id = closed.session.session_id.0,
                    duration_minutes = closed.session.duration_minutes.unwrap_or(0),
                    current_count = closed.context.current_count,
                    "check-out committed"
                );
                Ok(ScanReceipt {
                    outcome: ScanOutcome::Applied {
                        action: ToggleAction::CheckOut,
                        session: closed.session.timing(),
                    },
                    subject: Some(subject_summary),
                    eligible: closed.eligible(),
                    context: Some(closed.context),
                })
            }
            ToggleCommit::Denied { reason, context } => {
                debug!(
                    context_id = %context_id.as_str(),
                    subject_id = %subject_id.as_str(),
                    reason = reason.as_str(),
                    reason_code = reason.reason_code().0,
                    "check-in denied"
                );
                Ok(denied_receipt(reason, Some(subject_summary), Some(context)))
            }
        }
    }

    /// Appends the access-log row for a toggle outcome. Called with the partition lock held.
    fn audit_toggle(
        &self,
        commit: &ToggleCommit,
        subject_id: &SubjectId,
        context_id: &ContextId,
        now: MonotonicTimeNs,
    ) {
        match commit {
            ToggleCommit::CheckedIn { session, usage, .. } => {
                self.record_access(
                    Some(subject_id.clone()),
                    context_id,
                    Some(session.session_id),
                    AccessLogAction::CheckIn,
                    None,
                    true,
                    now,
                    AccessLogMetadata::empty().with("usage", *usage),
                );
            }
            ToggleCommit::CheckedOut(closed) => {
                self.record_access(
                    Some(subject_id.clone()),
                    context_id,
                    Some(closed.session.session_id),
                    AccessLogAction::CheckOut,
                    None,
                    true,
                    now,
                    closed.audit_metadata(),
                );
            }
            ToggleCommit::Denied { reason, context } => {
                self.record_access(
                    Some(subject_id.clone()),
                    context_id,
                    None,
                    AccessLogAction::Denied,
                    Some(*reason),
                    false,
                    now,
                    AccessLogMetadata::empty()
                        .with("current_count", context.current_count.to_string())
                        .with("capacity", context.capacity.to_string()),
                );
            }
        }
    }

    /// Audits an attempt that surfaced an error. Nothing was committed for it.
    fn record_commit_failure(
        &self,
        subject_id: Option<&SubjectId>,
        context_id: &ContextId,
        session_id: Option<PresenceSessionId>,
        operation: &'static str,
        err: &PresenceError,
        now: MonotonicTimeNs,
    ) {
        let error_kind = match err {
            PresenceError::NotFound { .. } => "not_found",
            PresenceError::AlreadyClosed { .. } => "already_closed",
            PresenceError::Conflict(_) => "conflict",
            PresenceError::Internal(_) => "internal",
        };
        error!(
            context_id = %context_id.as_str(),
            operation,
            error = %err,
            "presence commit failed"
        );
        self.record_access(
            subject_id.cloned(),
            context_id,
            session_id,
            AccessLogAction::Denied,
            Some(AccessReason::CommitFailed),
            false,
            now,
            AccessLogMetadata::empty()
                .with("operation", operation)
                .with("error_kind", error_kind),
        );
    }

    fn toggle_locked(
        &self,
        p: &mut ContextPartition,
        subject_id: &SubjectId,
        now: MonotonicTimeNs,
    ) -> Result<ToggleCommit, StorageError> {
        match decide_toggle(p.active_session_for(subject_id)) {
            ToggleDecision::CheckIn => match self.gate.admit(p.context(), p.aggregate()) {
                AdmissionDecision::Denied(reason) => Ok(ToggleCommit::Denied {
                    reason: reason.into(),
                    context: context_summary(p),
                }),
                AdmissionDecision::Approved => {
                    let session_id = self.store.allocate_session_id();
                    let session = p.pres_check_in_commit(session_id, subject_id.clone(), now)?;
                    let policy = policy_for(p.context().kind);
                    let eligible = policy.threshold_minutes(p.context()).map(|_| {
                        p.attendance_row(subject_id)
                            .map(|r| r.is_eligible)
                            .unwrap_or(false)
                    });
                    Ok(ToggleCommit::CheckedIn {
                        session,
                        context: context_summary(p),
                        usage: policy.usage_label(),
                        eligible,
                    })
                }
            },
            ToggleDecision::CheckOut(session_id) => Ok(ToggleCommit::CheckedOut(
                self.close_locked(p, session_id, SessionCloseReason::CheckOut, now)?,
            )),
        }
    }

    /// Close + decrement + accumulate for one ACTIVE session, shared by check-out and
    /// force-close.
    fn close_locked(
        &self,
        p: &mut ContextPartition,
        session_id: PresenceSessionId,
        close_reason: SessionCloseReason,
        now: MonotonicTimeNs,
    ) -> Result<ClosedSession, StorageError> {
        let Some(active) = p.session(session_id) else {
            return Err(StorageError::NotFound {
                table: "presence_sessions",
                key: session_id.0.to_string(),
            });
        };
        // A clock behind the session start closes it at zero duration.
        let ended_at = if now < active.started_at {
            warn!(
                context_id = %active.context_id.as_str(),
                session_id = session_id.0,
                started_at_ns = active.started_at.0,
                now_ns = now.0,
                "close time precedes session start; clamping"
            );
            active.started_at
        } else {
            now
        };
        let closed = active.closed(ended_at, close_reason)?;
        let policy = policy_for(p.context().kind);
        let threshold = policy.threshold_minutes(p.context());
        let current = p.attendance_row_or_empty(&closed.subject_id, threshold, ended_at);
        let accumulated = self.accumulator.accumulate(
            &current,
            closed.duration_minutes.unwrap_or(0),
            threshold,
            ended_at,
        );
        p.pres_close_commit(closed.clone(), accumulated.record.clone())?;
        Ok(ClosedSession {
            session: closed,
            accumulated,
            context: context_summary(p),
            usage: policy.usage_label(),
            tracks_eligibility: threshold.is_some(),
        })
    }

    /// Administrative close of an ACTIVE session. Same close path as a check-out scan,
    /// audited with reason `admin_override`. A CLOSED session is refused without touching
    /// the aggregate, and the refusal is audited as DENIED `already_closed`.
    pub fn force_close(
        &self,
        context_id: &ContextId,
        session_id: PresenceSessionId,
        now: MonotonicTimeNs,
    ) -> Result<ScanReceipt, PresenceError> {
        let step = self.with_conflict_retry(context_id, now, |p| {
            let status = p
                .session(session_id)
                .map(|s| (s.is_active(), s.subject_id.clone()));
            let step = match status {
                None => ForceCloseStep::Missing,
                Some((false, subject_id)) => ForceCloseStep::AlreadyClosed(subject_id),
                Some((true, _)) => ForceCloseStep::Closed(self.close_locked(
                    p,
                    session_id,
                    SessionCloseReason::AdminOverride,
                    now,
                )?),
            };
            self.audit_force_close(&step, context_id, session_id, now);
            Ok(step)
        });
        let step = match step {
            Ok(step) => step,
            Err(err) => {
                self.record_commit_failure(
                    None,
                    context_id,
                    Some(session_id),
                    "force_close",
                    &err,
                    now,
                );
                return Err(err);
            }
        };

        match step {
            None => {
                self.record_access(
                    None,
                    context_id,
                    Some(session_id),
                    AccessLogAction::Denied,
                    Some(AccessReason::UnknownContext),
                    false,
                    now,
                    AccessLogMetadata::empty().with("requested", "force_close"),
                );
                Err(PresenceError::unknown_context(context_id))
            }
            Some(ForceCloseStep::Missing) => Err(PresenceError::unknown_session(session_id)),
            Some(ForceCloseStep::AlreadyClosed(_)) => {
                debug!(
                    context_id = %context_id.as_str(),
                    session_id = session_id.0,
                    "force-close refused: session already closed"
                );
                Err(PresenceError::AlreadyClosed {
                    session_id: session_id.0,
                })
            }
            Some(ForceCloseStep::Closed(closed)) => {
                info!(
                    context_id = %context_id.as_str(),
                    subject_id = %closed.session.subject_id.as_str(),
                    session_id = session_id.0,
                    duration_minutes = closed.session.duration_minutes.unwrap_or(0),
                    "force-close committed"
                );
                let subject = match self.identity.resolve(closed.session.subject_id.as_str()) {
                    IdentityResolution::Resolved(r) => Some(SubjectSummary::from(&r)),
                    IdentityResolution::NotFound => None,
                };
                Ok(ScanReceipt {
                    outcome: ScanOutcome::Applied {
                        action: ToggleAction::CheckOut,
                        session: closed.session.timing(),
                    },
                    subject,
                    eligible: closed.eligible(),
                    context: Some(closed.context),
                })
            }
        }
    }

    /// Appends the access-log row for a force-close step. Called with the partition lock held.
    fn audit_force_close(
        &self,
        step: &ForceCloseStep,
        context_id: &ContextId,
        session_id: PresenceSessionId,
        now: MonotonicTimeNs,
    ) {
        let (subject_id, action, reason, success, metadata) = match step {
            ForceCloseStep::Missing => (
                None,
                AccessLogAction::Denied,
                AccessReason::UnknownSession,
                false,
                AccessLogMetadata::empty().with("requested", "force_close"),
            ),
            ForceCloseStep::AlreadyClosed(subject_id) => (
                Some(subject_id.clone()),
                AccessLogAction::Denied,
                AccessReason::AlreadyClosed,
                false,
                AccessLogMetadata::empty().with("requested", "force_close"),
            ),
            ForceCloseStep::Closed(closed) => (
                Some(closed.session.subject_id.clone()),
                AccessLogAction::CheckOut,
                AccessReason::AdminOverride,
                true,
                closed.audit_metadata(),
            ),
        };
        self.record_access(
            subject_id,
            context_id,
            Some(session_id),
            action,
            Some(reason),
            success,
            now,
            metadata,
        );
    }

    pub fn list_active_sessions(
        &self,
        context_id: &ContextId,
    ) -> Result<Vec<PresenceSessionRecord>, PresenceError> {
        self.reads
            .active_session_rows_for_context(context_id)
            .ok_or_else(|| PresenceError::unknown_context(context_id))
    }
}

fn denied_receipt(
    reason: AccessReason,
    subject: Option<SubjectSummary>,
    context: Option<ContextSummary>,
) -> ScanReceipt {
    ScanReceipt {
        outcome: ScanOutcome::Denied { reason },
        subject,
        context,
        eligible: None,
    }
}
