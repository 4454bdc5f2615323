//! Consent authorization state machine.
//!
//! Validates grant, revoke, request, approve and deny operations against the current projection
//! and appends the resulting events to the ledger. Every operation follows the same shape:
//!
//! 1. validate the inputs without touching the ledger,
//! 2. for operations on an existing record, take that record's stripe lock and catch the
//!    projection up so the guards see every event already in the ledger,
//! 3. append the events as one batch,
//! 4. ingest the appended events so the caller's next read observes them.
//!
//! Consent records move `Active → Revoked`. Access requests move `Pending → Approved | Denied`.
//! Expiry is never a stored transition; it is derived from `expiration_time` at read time.

use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::sync::Arc;

use consent_types::{DataCategory, Principal, Purpose, RecordId};
use tokio::sync::{Mutex, MutexGuard};

use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::event::{
    AccessApproved, AccessDenied, AccessRequested, ConsentGranted, ConsentRevoked, EventBody,
};
use crate::model::{is_expired_at, AccessRequest, ConsentRecord, RequestStatus, NEVER_EXPIRES};
use crate::sync::Materializer;
use crate::{ConsentError, ConsentResult};

const LOCK_STRIPES: usize = 64;

/// Outcome of [`AuthorizationService::approve_request`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Approval {
    pub request: AccessRequest,
    pub consent: ConsentRecord,
}

/// Service for the write side of the consent ledger.
#[derive(Clone)]
pub struct AuthorizationService {
    cfg: Arc<CoreConfig>,
    materializer: Arc<Materializer>,
    clock: Arc<dyn Clock>,
    stripes: Arc<[Mutex<()>]>,
    hasher: RandomState,
}

impl AuthorizationService {
    pub fn new(cfg: Arc<CoreConfig>, materializer: Arc<Materializer>, clock: Arc<dyn Clock>) -> Self {
        Self {
            cfg,
            materializer,
            clock,
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            hasher: RandomState::new(),
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.cfg
    }

    /// Grants consent from `patient` to `provider` for every (category, purpose) pair.
    ///
    /// # Arguments
    ///
    /// * `caller` - The principal performing the grant; must be `patient`.
    /// * `patient` - The patient whose data is covered.
    /// * `provider` - The provider receiving access.
    /// * `categories` - Data categories to cover. Duplicates are collapsed.
    /// * `purposes` - Purposes to cover. Duplicates are collapsed.
    /// * `expiration_time` - Epoch seconds, or `0` for never.
    ///
    /// # Returns
    ///
    /// One [`ConsentRecord`] per distinct pair, in category-major order.
    ///
    /// # Errors
    ///
    /// Returns a `ConsentError` if:
    /// - either list is empty (`MissingParameter`),
    /// - `expiration_time` is not in the future (`InvalidInput`),
    /// - `caller` is not the patient (`Forbidden`),
    /// - the ledger append fails.
    pub async fn grant_consent(
        &self,
        caller: &Principal,
        patient: &Principal,
        provider: &Principal,
        categories: &[DataCategory],
        purposes: &[Purpose],
        expiration_time: u64,
    ) -> ConsentResult<Vec<ConsentRecord>> {
        let now = self.clock.now();
        let pairs = cross_product(categories, purposes)?;
        check_expiration(expiration_time, now)?;
        if caller != patient {
            return Err(ConsentError::Forbidden("grant consent on behalf of another patient"));
        }

        let batch: Vec<EventBody> = pairs
            .into_iter()
            .map(|(data_category, purpose)| {
                EventBody::ConsentGranted(ConsentGranted {
                    consent_id: RecordId::generate(),
                    patient: patient.clone(),
                    provider: provider.clone(),
                    data_category,
                    purpose,
                    granted_at: now,
                    expiration_time,
                    request_id: None,
                })
            })
            .collect();
        let ids: Vec<RecordId> = batch
            .iter()
            .filter_map(|body| match body {
                EventBody::ConsentGranted(g) => Some(g.consent_id),
                _ => None,
            })
            .collect();

        self.commit(batch).await?;
        tracing::info!(
            patient = %patient,
            provider = %provider,
            count = ids.len(),
            "consent granted"
        );
        ids.iter().map(|id| self.committed_consent(id)).collect()
    }

    /// Revokes a consent.
    ///
    /// # Errors
    ///
    /// Returns a `ConsentError` if:
    /// - no consent has this id (`ConsentNotFound`),
    /// - `caller` is not the consent's patient (`Forbidden`),
    /// - the consent is already inactive (`AlreadyInactive`),
    /// - the ledger append fails.
    pub async fn revoke_consent(
        &self,
        consent_id: &RecordId,
        caller: &Principal,
    ) -> ConsentResult<ConsentRecord> {
        let _stripe = self.lock(consent_id).await;
        self.materializer.catch_up().await?;

        let record = self
            .materializer
            .projection()
            .consent(consent_id)
            .ok_or(ConsentError::ConsentNotFound(*consent_id))?;
        if &record.patient != caller {
            return Err(ConsentError::Forbidden("revoke a consent granted by another patient"));
        }
        if !record.active {
            return Err(ConsentError::AlreadyInactive(*consent_id));
        }

        self.commit(vec![EventBody::ConsentRevoked(ConsentRevoked {
            consent_id: record.id,
            patient: record.patient.clone(),
            provider: record.provider.clone(),
            data_category: record.data_category,
            purpose: record.purpose,
            revoked_at: self.clock.now(),
        })])
        .await?;
        tracing::info!(consent_id = %consent_id, "consent revoked");
        self.committed_consent(consent_id)
    }

    /// Files a pending access request from `requester` to `patient` for every
    /// (category, purpose) pair.
    ///
    /// # Errors
    ///
    /// Same input validation as [`grant_consent`](Self::grant_consent), without the caller
    /// check: the requester is the caller.
    pub async fn request_access(
        &self,
        requester: &Principal,
        patient: &Principal,
        categories: &[DataCategory],
        purposes: &[Purpose],
        expiration_time: u64,
    ) -> ConsentResult<Vec<AccessRequest>> {
        let now = self.clock.now();
        let pairs = cross_product(categories, purposes)?;
        check_expiration(expiration_time, now)?;

        let batch: Vec<EventBody> = pairs
            .into_iter()
            .map(|(data_category, purpose)| {
                EventBody::AccessRequested(AccessRequested {
                    request_id: RecordId::generate(),
                    requester: requester.clone(),
                    patient: patient.clone(),
                    data_category,
                    purpose,
                    requested_at: now,
                    expiration_time,
                })
            })
            .collect();
        let ids: Vec<RecordId> = batch
            .iter()
            .filter_map(|body| match body {
                EventBody::AccessRequested(r) => Some(r.request_id),
                _ => None,
            })
            .collect();

        self.commit(batch).await?;
        tracing::info!(
            requester = %requester,
            patient = %patient,
            count = ids.len(),
            "access requested"
        );
        ids.iter().map(|id| self.committed_request(id)).collect()
    }

    /// Approves a pending request, creating a consent with the request's category, purpose and
    /// expiration.
    ///
    /// The `AccessApproved` and `ConsentGranted` events are appended as one batch.
    ///
    /// # Errors
    ///
    /// Returns a `ConsentError` if:
    /// - no request has this id (`RequestNotFound`),
    /// - `caller` is not the request's patient (`Forbidden`),
    /// - the request is no longer pending (`AlreadyProcessed`),
    /// - the request expired while pending (`InvalidInput`),
    /// - the ledger append fails.
    pub async fn approve_request(
        &self,
        request_id: &RecordId,
        caller: &Principal,
    ) -> ConsentResult<Approval> {
        let _stripe = self.lock(request_id).await;
        let request = self.pending_request(request_id, caller).await?;
        let now = self.clock.now();
        if request.is_expired(now) {
            return Err(ConsentError::InvalidInput(format!(
                "access request {} expired at {}",
                request.id, request.expiration_time
            )));
        }

        let consent_id = RecordId::generate();
        self.commit(vec![
            EventBody::AccessApproved(AccessApproved {
                request_id: request.id,
                requester: request.requester.clone(),
                patient: request.patient.clone(),
                data_category: request.data_category,
                purpose: request.purpose,
                consent_id,
                processed_at: now,
            }),
            EventBody::ConsentGranted(ConsentGranted {
                consent_id,
                patient: request.patient.clone(),
                provider: request.requester.clone(),
                data_category: request.data_category,
                purpose: request.purpose,
                granted_at: now,
                expiration_time: request.expiration_time,
                request_id: Some(request.id),
            }),
        ])
        .await?;

        // Another writer may have decided the request between our read and our append.
        let committed = self.committed_request(request_id)?;
        if committed.consent_id != Some(consent_id) {
            tracing::warn!(request_id = %request_id, "access request decided by another writer first");
            return Err(ConsentError::AlreadyProcessed(*request_id));
        }
        tracing::info!(request_id = %request_id, consent_id = %consent_id, "access request approved");

        Ok(Approval {
            request: committed,
            consent: self.committed_consent(&consent_id)?,
        })
    }

    /// Denies a pending request. No consent is created.
    ///
    /// # Errors
    ///
    /// Same guards as [`approve_request`](Self::approve_request). An expired pending request may
    /// still be denied.
    pub async fn deny_request(
        &self,
        request_id: &RecordId,
        caller: &Principal,
    ) -> ConsentResult<AccessRequest> {
        let _stripe = self.lock(request_id).await;
        let request = self.pending_request(request_id, caller).await?;

        self.commit(vec![EventBody::AccessDenied(AccessDenied {
            request_id: request.id,
            requester: request.requester.clone(),
            patient: request.patient.clone(),
            data_category: request.data_category,
            purpose: request.purpose,
            processed_at: self.clock.now(),
        })])
        .await?;

        let committed = self.committed_request(request_id)?;
        if committed.status != RequestStatus::Denied {
            tracing::warn!(request_id = %request_id, "access request decided by another writer first");
            return Err(ConsentError::AlreadyProcessed(*request_id));
        }
        tracing::info!(request_id = %request_id, "access request denied");
        Ok(committed)
    }

    async fn pending_request(
        &self,
        request_id: &RecordId,
        caller: &Principal,
    ) -> ConsentResult<AccessRequest> {
        self.materializer.catch_up().await?;
        let request = self
            .materializer
            .projection()
            .request(request_id)
            .ok_or(ConsentError::RequestNotFound(*request_id))?;
        if &request.patient != caller {
            return Err(ConsentError::Forbidden("decide an access request addressed to another patient"));
        }
        if request.status != RequestStatus::Pending {
            return Err(ConsentError::AlreadyProcessed(*request_id));
        }
        Ok(request)
    }

    async fn commit(&self, batch: Vec<EventBody>) -> ConsentResult<()> {
        let events = self.materializer.ledger().append(batch).await?;
        self.materializer.ingest(&events).await
    }

    fn committed_consent(&self, id: &RecordId) -> ConsentResult<ConsentRecord> {
        self.materializer.projection().consent(id).ok_or_else(|| {
            ConsentError::Internal(format!("consent {} missing from projection after append", id))
        })
    }

    fn committed_request(&self, id: &RecordId) -> ConsentResult<AccessRequest> {
        self.materializer.projection().request(id).ok_or_else(|| {
            ConsentError::Internal(format!("request {} missing from projection after append", id))
        })
    }

    async fn lock(&self, id: &RecordId) -> MutexGuard<'_, ()> {
        let idx = (self.hasher.hash_one(id) as usize) % self.stripes.len();
        self.stripes[idx].lock().await
    }
}

fn check_expiration(expiration_time: u64, now: u64) -> ConsentResult<()> {
    if expiration_time != NEVER_EXPIRES && is_expired_at(expiration_time, now) {
        return Err(ConsentError::InvalidInput(format!(
            "expirationTime {} must be 0 or later than the current time {}",
            expiration_time, now
        )));
    }
    Ok(())
}

/// Distinct (category, purpose) pairs, category-major, first occurrence order.
fn cross_product(
    categories: &[DataCategory],
    purposes: &[Purpose],
) -> ConsentResult<Vec<(DataCategory, Purpose)>> {
    if categories.is_empty() {
        return Err(ConsentError::MissingParameter("dataCategories"));
    }
    if purposes.is_empty() {
        return Err(ConsentError::MissingParameter("purposes"));
    }
    let categories = dedup(categories);
    let purposes = dedup(purposes);
    Ok(categories
        .iter()
        .flat_map(|c| purposes.iter().map(move |p| (*c, *p)))
        .collect())
}

fn dedup<T: Copy + PartialEq>(items: &[T]) -> Vec<T> {
    let mut out: Vec<T> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(item) {
            out.push(*item);
        }
    }
    out
}
