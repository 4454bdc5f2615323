//! # Projection Engine
//!
//! Folds the ledger's event stream into query views. Each event touches only the keys it names,
//! so applying one is O(1) amortised and queries never rescan history or fetch records one by
//! one.
//!
//! ## Views
//!
//! - records by id (consents and requests)
//! - active consents by patient and by provider, ordered by grant sequence
//! - every consent by patient and by provider, for `includeExpired` listings
//! - consent ids per `(patient, provider, category)` for status checks
//! - pending requests by provider and by patient, plus every request per side
//! - the full sequence-ordered history and a per-principal slice of it
//!
//! ## Ordering
//!
//! Events must arrive in sequence order. An event at or below the watermark is a duplicate and
//! is skipped, which makes replay idempotent. An event beyond `watermark + 1` is a gap and is
//! refused without touching any view.
//!
//! Applies are serialised by the cursor lock. Reads take only the shard locks of the keys they
//! touch. Before the views change, every scope the event touches has its version bumped to the
//! event's sequence; the watermark is published last. A reader that sampled the watermark before
//! computing can therefore tell whether its result may predate a change to its scope.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use consent_types::{DataCategory, Principal, RecordId};
use parking_lot::{Mutex, RwLock};

use crate::event::{
    AccessApproved, AccessDenied, AccessRequested, ConsentGranted, ConsentRevoked, EventBody,
    LedgerEvent,
};
use crate::model::{
    AccessRequest, ConsentRecord, ConsentView, RequestFilter, RequestStatus, RequestView, Role,
    StatusCheck,
};
use crate::sharded::Sharded;
use crate::{ConsentError, ConsentResult};

/// A slice of the views that one event can change. Cache entries are tagged with the scope they
/// were computed from.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ViewScope {
    Status {
        patient: Principal,
        provider: Principal,
        category: DataCategory,
    },
    Consents {
        role: Role,
        principal: Principal,
    },
    Requests {
        role: Role,
        principal: Principal,
    },
}

#[derive(Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The event changed the views; these scopes were touched.
    Applied(Vec<ViewScope>),
    /// The event's sequence was already applied.
    Duplicate,
}

type SideKey = (Role, Principal);
type StatusKey = (Principal, Principal, DataCategory);

pub struct ProjectionEngine {
    cursor: Mutex<()>,
    watermark: AtomicU64,
    consents: Sharded<RecordId, ConsentRecord>,
    requests: Sharded<RecordId, AccessRequest>,
    active: Sharded<SideKey, BTreeMap<u64, RecordId>>,
    all_consents: Sharded<SideKey, Vec<RecordId>>,
    by_status_key: Sharded<StatusKey, Vec<RecordId>>,
    pending: Sharded<SideKey, BTreeMap<u64, RecordId>>,
    all_requests: Sharded<SideKey, Vec<RecordId>>,
    history: RwLock<Vec<Arc<LedgerEvent>>>,
    history_by: Sharded<Principal, Vec<Arc<LedgerEvent>>>,
    scope_versions: Sharded<ViewScope, u64>,
}

impl Default for ProjectionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ProjectionEngine {
    pub fn new() -> Self {
        Self {
            cursor: Mutex::new(()),
            watermark: AtomicU64::new(0),
            consents: Sharded::new(),
            requests: Sharded::new(),
            active: Sharded::new(),
            all_consents: Sharded::new(),
            by_status_key: Sharded::new(),
            pending: Sharded::new(),
            all_requests: Sharded::new(),
            history: RwLock::new(Vec::new()),
            history_by: Sharded::new(),
            scope_versions: Sharded::new(),
        }
    }

    /// Highest sequence applied so far; 0 before the first event.
    pub fn watermark(&self) -> u64 {
        self.watermark.load(Ordering::Acquire)
    }

    /// Sequence of the last event that touched `scope`, or 0.
    pub fn scope_version(&self, scope: &ViewScope) -> u64 {
        self.scope_versions.get(scope).unwrap_or(0)
    }

    /// Applies one event.
    ///
    /// # Errors
    ///
    /// Returns [`ConsentError::SequenceGap`] if `event.sequence` is not the next sequence. The
    /// views are left unchanged.
    pub fn apply(&self, event: &LedgerEvent) -> ConsentResult<ApplyOutcome> {
        let _cursor = self.cursor.lock();
        let watermark = self.watermark.load(Ordering::Acquire);
        if event.sequence <= watermark {
            tracing::trace!(sequence = event.sequence, "skipping already applied event");
            return Ok(ApplyOutcome::Duplicate);
        }
        if event.sequence != watermark + 1 {
            return Err(ConsentError::SequenceGap {
                expected: watermark + 1,
                found: event.sequence,
            });
        }

        let scopes = scopes_of(&event.body);
        for scope in &scopes {
            self.scope_versions.insert(scope.clone(), event.sequence);
        }

        match &event.body {
            EventBody::ConsentGranted(e) => self.on_granted(event.sequence, e),
            EventBody::ConsentRevoked(e) => self.on_revoked(event.sequence, e),
            EventBody::AccessRequested(e) => self.on_requested(event.sequence, e),
            EventBody::AccessApproved(e) => self.on_approved(event.sequence, e),
            EventBody::AccessDenied(e) => self.on_denied(event.sequence, e),
        }

        let shared = Arc::new(event.clone());
        let (a, b) = event.body.parties();
        self.history_by
            .upsert(a.clone(), |h| h.push(Arc::clone(&shared)));
        if a != b {
            self.history_by
                .upsert(b.clone(), |h| h.push(Arc::clone(&shared)));
        }
        self.history.write().push(shared);

        self.watermark.store(event.sequence, Ordering::Release);
        Ok(ApplyOutcome::Applied(scopes))
    }

    fn on_granted(&self, sequence: u64, e: &ConsentGranted) {
        if let Some(request_id) = e.request_id {
            let approved_with_this_consent = self.requests.read(&request_id, |r| {
                r.is_some_and(|r| {
                    r.status == RequestStatus::Approved && r.consent_id == Some(e.consent_id)
                })
            });
            if !approved_with_this_consent {
                tracing::warn!(
                    sequence,
                    consent_id = %e.consent_id,
                    request_id = %request_id,
                    "grant for a request not approved with this consent ignored"
                );
                return;
            }
        }
        let record = ConsentRecord {
            id: e.consent_id,
            patient: e.patient.clone(),
            provider: e.provider.clone(),
            data_category: e.data_category,
            purpose: e.purpose,
            granted_at: e.granted_at,
            expiration_time: e.expiration_time,
            active: true,
            sequence,
            revoked_at: None,
            request_id: e.request_id,
        };
        if !self.consents.insert_new(e.consent_id, record) {
            tracing::warn!(sequence, consent_id = %e.consent_id, "duplicate consent id ignored");
            return;
        }
        for key in sides(&e.patient, &e.provider) {
            self.active
                .upsert(key.clone(), |m| m.insert(sequence, e.consent_id));
            self.all_consents.upsert(key, |v| v.push(e.consent_id));
        }
        self.by_status_key.upsert(
            (e.patient.clone(), e.provider.clone(), e.data_category),
            |v| v.push(e.consent_id),
        );
    }

    fn on_revoked(&self, sequence: u64, e: &ConsentRevoked) {
        let granted_seq = self.consents.modify(&e.consent_id, |record| {
            if !record.active {
                return None;
            }
            record.active = false;
            record.revoked_at = Some(e.revoked_at);
            Some(record.sequence)
        });
        match granted_seq {
            Some(Some(granted_seq)) => {
                for key in sides(&e.patient, &e.provider) {
                    self.active.modify(&key, |m| m.remove(&granted_seq));
                }
            }
            Some(None) => {
                tracing::warn!(sequence, consent_id = %e.consent_id, "revoke of inactive consent ignored")
            }
            None => {
                tracing::warn!(sequence, consent_id = %e.consent_id, "revoke of unknown consent ignored")
            }
        }
    }

    fn on_requested(&self, sequence: u64, e: &AccessRequested) {
        let request = AccessRequest {
            id: e.request_id,
            requester: e.requester.clone(),
            patient: e.patient.clone(),
            data_category: e.data_category,
            purpose: e.purpose,
            requested_at: e.requested_at,
            expiration_time: e.expiration_time,
            status: RequestStatus::Pending,
            sequence,
            processed_at: None,
            consent_id: None,
        };
        if !self.requests.insert_new(e.request_id, request) {
            tracing::warn!(sequence, request_id = %e.request_id, "duplicate request id ignored");
            return;
        }
        for key in sides(&e.patient, &e.requester) {
            self.pending
                .upsert(key.clone(), |m| m.insert(sequence, e.request_id));
            self.all_requests.upsert(key, |v| v.push(e.request_id));
        }
    }

    fn on_approved(&self, sequence: u64, e: &AccessApproved) {
        self.settle(
            sequence,
            e.request_id,
            &e.patient,
            &e.requester,
            RequestStatus::Approved,
            e.processed_at,
            Some(e.consent_id),
        );
    }

    fn on_denied(&self, sequence: u64, e: &AccessDenied) {
        self.settle(
            sequence,
            e.request_id,
            &e.patient,
            &e.requester,
            RequestStatus::Denied,
            e.processed_at,
            None,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn settle(
        &self,
        sequence: u64,
        request_id: RecordId,
        patient: &Principal,
        requester: &Principal,
        status: RequestStatus,
        processed_at: u64,
        consent_id: Option<RecordId>,
    ) {
        let requested_seq = self.requests.modify(&request_id, |request| {
            if request.status != RequestStatus::Pending {
                return None;
            }
            request.status = status;
            request.processed_at = Some(processed_at);
            request.consent_id = consent_id;
            Some(request.sequence)
        });
        match requested_seq {
            Some(Some(requested_seq)) => {
                for key in sides(patient, requester) {
                    self.pending.modify(&key, |m| m.remove(&requested_seq));
                }
            }
            Some(None) => tracing::warn!(
                sequence,
                request_id = %request_id,
                status = status.as_str(),
                "settlement of processed request ignored"
            ),
            None => tracing::warn!(
                sequence,
                request_id = %request_id,
                "settlement of unknown request ignored"
            ),
        }
    }

    pub fn consent(&self, id: &RecordId) -> Option<ConsentRecord> {
        self.consents.get(id)
    }

    pub fn request(&self, id: &RecordId) -> Option<AccessRequest> {
        self.requests.get(id)
    }

    pub fn consent_count(&self) -> usize {
        self.consents.len()
    }

    pub fn request_count(&self) -> usize {
        self.requests.len()
    }

    /// Status of `(patient, provider, category)` at `now`. The newest authorising record wins.
    /// Without one, the newest active record that has expired is reported.
    pub fn status(
        &self,
        patient: &Principal,
        provider: &Principal,
        category: DataCategory,
        now: u64,
    ) -> StatusCheck {
        let key = (patient.clone(), provider.clone(), category);
        let ids = self
            .by_status_key
            .read(&key, |ids| ids.cloned().unwrap_or_default());

        let mut expired: Option<ConsentRecord> = None;
        for id in ids.iter().rev() {
            let Some(record) = self.consents.get(id) else {
                continue;
            };
            if record.authorizes(now) {
                return StatusCheck {
                    has_consent: true,
                    consent_id: Some(record.id),
                    is_expired: false,
                    expiration_time: Some(record.expiration_time),
                };
            }
            if record.active && expired.is_none() {
                expired = Some(record);
            }
        }

        match expired {
            Some(record) => StatusCheck {
                has_consent: false,
                consent_id: Some(record.id),
                is_expired: true,
                expiration_time: Some(record.expiration_time),
            },
            None => StatusCheck::none(),
        }
    }

    /// Consents on `role`'s side for `principal`, oldest grant first.
    ///
    /// Without `include_expired` only records that authorise at `now` are listed; with it, every
    /// record, revoked ones included.
    pub fn consents_for(
        &self,
        role: Role,
        principal: &Principal,
        include_expired: bool,
        now: u64,
    ) -> Vec<ConsentView> {
        let key = (role, principal.clone());
        let ids: Vec<RecordId> = if include_expired {
            self.all_consents
                .read(&key, |ids| ids.cloned().unwrap_or_default())
        } else {
            self.active.read(&key, |m| {
                m.map(|m| m.values().copied().collect())
                    .unwrap_or_default()
            })
        };
        ids.iter()
            .filter_map(|id| self.consents.get(id))
            .filter(|r| include_expired || !r.is_expired(now))
            .map(|r| ConsentView::at(r, now))
            .collect()
    }

    pub fn active_consents_by_patient(&self, patient: &Principal, now: u64) -> Vec<ConsentView> {
        self.consents_for(Role::Patient, patient, false, now)
    }

    pub fn active_consents_by_provider(&self, provider: &Principal, now: u64) -> Vec<ConsentView> {
        self.consents_for(Role::Provider, provider, false, now)
    }

    /// Requests on `role`'s side for `principal` matching `filter`, oldest first.
    pub fn requests_for(
        &self,
        role: Role,
        principal: &Principal,
        filter: RequestFilter,
        now: u64,
    ) -> Vec<RequestView> {
        let key = (role, principal.clone());
        let ids: Vec<RecordId> = if filter == RequestFilter::Pending {
            self.pending.read(&key, |m| {
                m.map(|m| m.values().copied().collect())
                    .unwrap_or_default()
            })
        } else {
            self.all_requests
                .read(&key, |ids| ids.cloned().unwrap_or_default())
        };
        ids.iter()
            .filter_map(|id| self.requests.get(id))
            .filter(|r| filter.matches(r.status))
            .map(|r| RequestView::at(r, now))
            .collect()
    }

    pub fn pending_requests_by_provider(&self, provider: &Principal, now: u64) -> Vec<RequestView> {
        self.requests_for(Role::Provider, provider, RequestFilter::Pending, now)
    }

    pub fn pending_requests_by_patient(&self, patient: &Principal, now: u64) -> Vec<RequestView> {
        self.requests_for(Role::Patient, patient, RequestFilter::Pending, now)
    }

    /// Applied events in `from..=to`, optionally only those involving `principal`.
    pub fn history(&self, principal: Option<&Principal>, from: u64, to: u64) -> Vec<LedgerEvent> {
        let select = |events: &[Arc<LedgerEvent>]| -> Vec<LedgerEvent> {
            let start = events.partition_point(|e| e.sequence < from);
            let end = events.partition_point(|e| e.sequence <= to);
            events[start..end.max(start)]
                .iter()
                .map(|e| LedgerEvent::clone(e))
                .collect()
        };
        match principal {
            Some(p) => self
                .history_by
                .read(p, |events| events.map(|e| select(e.as_slice())).unwrap_or_default()),
            None => select(self.history.read().as_slice()),
        }
    }

    /// Every applied event in sequence order.
    pub fn full_history(&self) -> Vec<LedgerEvent> {
        self.history
            .read()
            .iter()
            .map(|e| LedgerEvent::clone(e))
            .collect()
    }

    /// Ordered copy of every view, for comparing two projections.
    pub fn snapshot(&self) -> ProjectionSnapshot {
        let ordered = |m: Vec<(SideKey, BTreeMap<u64, RecordId>)>| {
            m.into_iter()
                .filter(|(_, v)| !v.is_empty())
                .map(|((role, p), v)| ((role_tag(role), p), v.into_values().collect()))
                .collect()
        };
        let listed = |m: Vec<(SideKey, Vec<RecordId>)>| {
            m.into_iter()
                .map(|((role, p), v)| ((role_tag(role), p), v))
                .collect()
        };
        ProjectionSnapshot {
            watermark: self.watermark(),
            consents: self.consents.entries().into_iter().collect(),
            requests: self.requests.entries().into_iter().collect(),
            active: ordered(self.active.entries()),
            pending: ordered(self.pending.entries()),
            all_consents: listed(self.all_consents.entries()),
            all_requests: listed(self.all_requests.entries()),
            history: self.history.read().iter().map(|e| e.sequence).collect(),
        }
    }
}

/// Deterministically ordered dump of a [`ProjectionEngine`].
#[derive(Debug, PartialEq, Eq)]
pub struct ProjectionSnapshot {
    pub watermark: u64,
    pub consents: BTreeMap<RecordId, ConsentRecord>,
    pub requests: BTreeMap<RecordId, AccessRequest>,
    pub active: BTreeMap<(u8, Principal), Vec<RecordId>>,
    pub pending: BTreeMap<(u8, Principal), Vec<RecordId>>,
    pub all_consents: BTreeMap<(u8, Principal), Vec<RecordId>>,
    pub all_requests: BTreeMap<(u8, Principal), Vec<RecordId>>,
    pub history: Vec<u64>,
}

fn role_tag(role: Role) -> u8 {
    match role {
        Role::Patient => 0,
        Role::Provider => 1,
    }
}

fn sides(patient: &Principal, other: &Principal) -> [SideKey; 2] {
    [
        (Role::Patient, patient.clone()),
        (Role::Provider, other.clone()),
    ]
}

fn scopes_of(body: &EventBody) -> Vec<ViewScope> {
    let consent = |patient: &Principal, provider: &Principal, category: DataCategory| {
        vec![
            ViewScope::Status {
                patient: patient.clone(),
                provider: provider.clone(),
                category,
            },
            ViewScope::Consents {
                role: Role::Patient,
                principal: patient.clone(),
            },
            ViewScope::Consents {
                role: Role::Provider,
                principal: provider.clone(),
            },
        ]
    };
    let request = |patient: &Principal, requester: &Principal| {
        vec![
            ViewScope::Requests {
                role: Role::Patient,
                principal: patient.clone(),
            },
            ViewScope::Requests {
                role: Role::Provider,
                principal: requester.clone(),
            },
        ]
    };
    match body {
        EventBody::ConsentGranted(e) => consent(&e.patient, &e.provider, e.data_category),
        EventBody::ConsentRevoked(e) => consent(&e.patient, &e.provider, e.data_category),
        EventBody::AccessRequested(e) => request(&e.patient, &e.requester),
        EventBody::AccessApproved(e) => request(&e.patient, &e.requester),
        EventBody::AccessDenied(e) => request(&e.patient, &e.requester),
    }
}

#[cfg(test)]
mod tests {
    use consent_types::Purpose;

    use super::*;
    use crate::testutil::{granted, principal, T0};

    fn seq(sequence: u64, body: EventBody) -> LedgerEvent {
        LedgerEvent { sequence, body }
    }

    fn grant_at(patient: &str, provider: &str, expiration_time: u64) -> EventBody {
        match granted(patient, provider) {
            EventBody::ConsentGranted(mut g) => {
                g.expiration_time = expiration_time;
                EventBody::ConsentGranted(g)
            }
            other => other,
        }
    }

    fn revoke_of(event: &LedgerEvent) -> EventBody {
        match &event.body {
            EventBody::ConsentGranted(g) => EventBody::ConsentRevoked(ConsentRevoked {
                consent_id: g.consent_id,
                patient: g.patient.clone(),
                provider: g.provider.clone(),
                data_category: g.data_category,
                purpose: g.purpose,
                revoked_at: T0 + 5,
            }),
            other => panic!("not a grant: {:?}", other),
        }
    }

    fn requested(requester: &str, patient: &str) -> EventBody {
        EventBody::AccessRequested(AccessRequested {
            request_id: RecordId::generate(),
            requester: principal(requester),
            patient: principal(patient),
            data_category: DataCategory::VitalSigns,
            purpose: Purpose::Research,
            requested_at: T0,
            expiration_time: 0,
        })
    }

    fn log() -> Vec<LedgerEvent> {
        let g1 = seq(1, granted("P1", "Q1"));
        let g2 = seq(2, granted("P1", "Q2"));
        let r3 = seq(3, revoke_of(&g1));
        let q4 = seq(4, requested("Q1", "P1"));
        vec![g1, g2, r3, q4]
    }

    #[test]
    fn test_replay_twice_yields_identical_views() {
        let events = log();

        let once = ProjectionEngine::new();
        for e in &events {
            once.apply(e).unwrap();
        }

        let twice = ProjectionEngine::new();
        for e in events.iter().chain(events.iter()) {
            twice.apply(e).unwrap();
        }

        assert_eq!(once.snapshot(), twice.snapshot());
        assert_eq!(twice.watermark(), 4);
        assert_eq!(twice.consent_count(), 2);
        assert_eq!(twice.full_history().len(), 4);
    }

    #[test]
    fn test_duplicate_sequence_is_reported_and_skipped() {
        let engine = ProjectionEngine::new();
        let event = seq(1, granted("P1", "Q1"));
        assert!(matches!(engine.apply(&event).unwrap(), ApplyOutcome::Applied(_)));
        assert_eq!(engine.apply(&event).unwrap(), ApplyOutcome::Duplicate);
    }

    #[test]
    fn test_gap_is_refused_without_changing_views() {
        let engine = ProjectionEngine::new();
        engine.apply(&seq(1, granted("P1", "Q1"))).unwrap();

        let err = engine.apply(&seq(3, granted("P1", "Q2"))).unwrap_err();
        assert!(matches!(
            err,
            ConsentError::SequenceGap {
                expected: 2,
                found: 3
            }
        ));
        assert_eq!(engine.watermark(), 1);
        assert_eq!(engine.consent_count(), 1);
    }

    #[test]
    fn test_revoke_removes_from_active_views_only() {
        let engine = ProjectionEngine::new();
        for e in log() {
            engine.apply(&e).unwrap();
        }
        let p1 = principal("P1");
        let q1 = principal("Q1");

        let active = engine.active_consents_by_patient(&p1, T0);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].record.provider, principal("Q2"));

        let all = engine.consents_for(Role::Patient, &p1, true, T0);
        assert_eq!(all.len(), 2);
        assert!(!all[0].record.active);
        assert_eq!(all[0].record.revoked_at, Some(T0 + 5));

        assert!(engine.active_consents_by_provider(&q1, T0).is_empty());
        assert!(!engine.status(&p1, &q1, DataCategory::MedicalRecords, T0).has_consent);
    }

    #[test]
    fn test_status_prefers_newest_authorising_record() {
        let engine = ProjectionEngine::new();
        let older = seq(1, grant_at("P1", "Q1", 0));
        let newer = seq(2, grant_at("P1", "Q1", T0 + 100));
        engine.apply(&older).unwrap();
        engine.apply(&newer).unwrap();
        let (p1, q1) = (principal("P1"), principal("Q1"));

        let status = engine.status(&p1, &q1, DataCategory::MedicalRecords, T0);
        assert!(status.has_consent);
        assert_eq!(status.expiration_time, Some(T0 + 100));

        // Once the newer one expires the older, never-expiring one still authorises.
        let later = engine.status(&p1, &q1, DataCategory::MedicalRecords, T0 + 100);
        assert!(later.has_consent);
        assert_eq!(later.expiration_time, Some(0));
    }

    #[test]
    fn test_status_reports_expired_record_without_authorising() {
        let engine = ProjectionEngine::new();
        let event = seq(1, grant_at("P1", "Q1", T0 + 10));
        engine.apply(&event).unwrap();
        let (p1, q1) = (principal("P1"), principal("Q1"));

        let status = engine.status(&p1, &q1, DataCategory::MedicalRecords, T0 + 10);
        assert!(!status.has_consent);
        assert!(status.is_expired);
        assert!(status.consent_id.is_some());

        assert!(engine.active_consents_by_patient(&p1, T0 + 10).is_empty());
        let all = engine.consents_for(Role::Patient, &p1, true, T0 + 10);
        assert!(all[0].is_expired);

        let other = engine.status(&p1, &q1, DataCategory::GeneticData, T0);
        assert_eq!(other, StatusCheck::none());
    }

    #[test]
    fn test_settled_request_leaves_pending_views() {
        let engine = ProjectionEngine::new();
        let req = seq(1, requested("Q1", "P1"));
        engine.apply(&req).unwrap();
        let EventBody::AccessRequested(r) = &req.body else {
            unreachable!()
        };
        let (p1, q1) = (principal("P1"), principal("Q1"));
        assert_eq!(engine.pending_requests_by_provider(&q1, T0).len(), 1);
        assert_eq!(engine.pending_requests_by_patient(&p1, T0).len(), 1);

        engine
            .apply(&seq(
                2,
                EventBody::AccessDenied(AccessDenied {
                    request_id: r.request_id,
                    requester: q1.clone(),
                    patient: p1.clone(),
                    data_category: r.data_category,
                    purpose: r.purpose,
                    processed_at: T0 + 1,
                }),
            ))
            .unwrap();

        assert!(engine.pending_requests_by_provider(&q1, T0).is_empty());
        let denied = engine.requests_for(Role::Patient, &p1, RequestFilter::Denied, T0);
        assert_eq!(denied.len(), 1);
        assert_eq!(denied[0].request.processed_at, Some(T0 + 1));
        assert_eq!(
            engine
                .requests_for(Role::Patient, &p1, RequestFilter::All, T0)
                .len(),
            1
        );
    }

    #[test]
    fn test_second_approval_of_one_request_grants_nothing() {
        let engine = ProjectionEngine::new();
        let req = seq(1, requested("Q1", "P1"));
        let EventBody::AccessRequested(r) = &req.body else {
            unreachable!()
        };
        let (p1, q1) = (principal("P1"), principal("Q1"));
        let approval = |consent_id: RecordId| {
            [
                EventBody::AccessApproved(AccessApproved {
                    request_id: r.request_id,
                    requester: q1.clone(),
                    patient: p1.clone(),
                    data_category: r.data_category,
                    purpose: r.purpose,
                    consent_id,
                    processed_at: T0 + 1,
                }),
                EventBody::ConsentGranted(ConsentGranted {
                    consent_id,
                    patient: p1.clone(),
                    provider: q1.clone(),
                    data_category: r.data_category,
                    purpose: r.purpose,
                    granted_at: T0 + 1,
                    expiration_time: 0,
                    request_id: Some(r.request_id),
                }),
            ]
        };
        let (first, second) = (RecordId::generate(), RecordId::generate());

        engine.apply(&req).unwrap();
        let mut sequence = 1;
        for body in approval(first).into_iter().chain(approval(second)) {
            sequence += 1;
            engine.apply(&seq(sequence, body)).unwrap();
        }

        let held = engine.consents_for(Role::Provider, &q1, false, T0 + 2);
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].record.id, first);
        assert!(engine.consent(&second).is_none());
        assert_eq!(engine.request(&r.request_id).unwrap().consent_id, Some(first));
        assert_eq!(engine.watermark(), 5);
    }

    #[test]
    fn test_scope_versions_track_last_touching_event() {
        let engine = ProjectionEngine::new();
        for e in log() {
            engine.apply(&e).unwrap();
        }
        let patient_consents = ViewScope::Consents {
            role: Role::Patient,
            principal: principal("P1"),
        };
        let q2_consents = ViewScope::Consents {
            role: Role::Provider,
            principal: principal("Q2"),
        };
        let p1_requests = ViewScope::Requests {
            role: Role::Patient,
            principal: principal("P1"),
        };
        assert_eq!(engine.scope_version(&patient_consents), 3);
        assert_eq!(engine.scope_version(&q2_consents), 2);
        assert_eq!(engine.scope_version(&p1_requests), 4);
    }

    #[test]
    fn test_history_filters_by_principal_and_window() {
        let engine = ProjectionEngine::new();
        for e in log() {
            engine.apply(&e).unwrap();
        }
        let q2 = principal("Q2");
        let seqs = |events: Vec<LedgerEvent>| events.iter().map(|e| e.sequence).collect::<Vec<_>>();

        assert_eq!(seqs(engine.history(None, 2, 3)), vec![2, 3]);
        assert_eq!(seqs(engine.history(Some(&q2), 1, 4)), vec![2]);
        assert_eq!(seqs(engine.history(Some(&principal("P1")), 3, 10)), vec![3, 4]);
        assert!(engine.history(Some(&principal("Z9")), 1, 4).is_empty());
    }
}
