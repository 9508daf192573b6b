//! CA rotation controller.
//!
//! Drives the versioned CA state record through `active -> rotating ->
//! retiring -> active`. Each reconcile re-reads durable state, performs the
//! work owed by the current status, and advances the record with a
//! compare-and-swap. Losing a swap means another attempt owns the step; the
//! loser backs off until the next tick.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use time::{Duration, OffsetDateTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::authority::{CaRepository, VersionedState};
use crate::config::SignerSettings;
use crate::domain::{CaStatus, CertificateAuthority};
use crate::errors::{Error, Result};
use crate::observability::MetricsRecorder;
use crate::pki::{cross_sign, is_rotation_due};
use crate::rotation_span;

/// Upper bound on state transitions taken in a single reconcile.
const MAX_STEPS_PER_RECONCILE: usize = 4;

/// How long before the outgoing CA's NotAfter a shortened overlap must close,
/// so the retirement tick still runs while the old CA is valid.
const RETIREMENT_MARGIN: Duration = Duration::hours(1);

/// What a reconcile did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationOutcome {
    /// Nothing was owed.
    Steady,
    /// The stored active CA differs from the record and was adopted.
    Adopted { serial: String },
    RotationStarted,
    /// Replacement CA and cross-signed pair are published.
    OverlapPublished { next_serial: String, overlap_ends_at: OffsetDateTime },
    RetirementStarted,
    Completed { active_serial: String },
    /// Another attempt moved the record first.
    Conflict { generation: u64 },
}

impl RotationOutcome {
    pub fn is_transition(&self) -> bool {
        !matches!(self, RotationOutcome::Steady | RotationOutcome::Conflict { .. })
    }
}

enum Step {
    Idle,
    Advanced(RotationOutcome),
}

pub struct CaRotationController {
    authority: Arc<CaRepository>,
    ca_validity: Duration,
    overlap_window: Duration,
    interval: StdDuration,
    metrics: MetricsRecorder,
}

impl CaRotationController {
    pub fn new(
        authority: Arc<CaRepository>,
        ca_validity: Duration,
        overlap_window: Duration,
        interval: StdDuration,
    ) -> Self {
        Self { authority, ca_validity, overlap_window, interval, metrics: MetricsRecorder::new() }
    }

    pub fn from_settings(authority: Arc<CaRepository>, settings: &SignerSettings, interval: StdDuration) -> Self {
        Self::new(authority, settings.ca_validity(), settings.overlap_window(), interval)
    }

    /// Take every transition currently owed, up to a small bound.
    pub async fn reconcile(&self, now: OffsetDateTime) -> Result<RotationOutcome> {
        let mut outcome = RotationOutcome::Steady;
        for _ in 0..MAX_STEPS_PER_RECONCILE {
            match self.step(now).await {
                Ok(Step::Idle) => break,
                Ok(Step::Advanced(next)) => outcome = next,
                Err(Error::RotationConflict { generation }) => {
                    debug!(generation, "CA state moved concurrently; yielding to the other attempt");
                    return Ok(RotationOutcome::Conflict { generation });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(outcome)
    }

    async fn step(&self, now: OffsetDateTime) -> Result<Step> {
        let current = self
            .authority
            .load_state()
            .await?
            .ok_or_else(|| Error::not_found("CA state record"))?;
        let active = self
            .authority
            .load_active()
            .await?
            .ok_or_else(|| Error::not_found("active CA"))?;
        self.metrics.set_ca_not_after(active.certificate().not_after().unix_timestamp());

        let span = rotation_span!(current.record.generation, current.record.status, active_serial = %active.serial());
        async {
            match current.record.status {
                CaStatus::Active => self.on_active(&current, &active, now).await,
                CaStatus::Rotating => self.on_rotating(&current, &active, now).await,
                CaStatus::Retiring => self.on_retiring(&current, &active, now).await,
            }
        }
        .instrument(span)
        .await
    }

    async fn on_active(&self, current: &VersionedState, active: &CertificateAuthority, now: OffsetDateTime) -> Result<Step> {
        if current.record.active_serial != active.serial() {
            warn!(
                recorded = %current.record.active_serial,
                stored = %active.serial(),
                "Active CA was replaced outside rotation; adopting it"
            );
            let record = current.record.complete_rotation(active.serial(), now);
            self.authority.compare_and_swap(current, record).await?;
            self.publish().await?;
            return Ok(Step::Advanced(RotationOutcome::Adopted { serial: active.serial().to_string() }));
        }

        let cert = active.certificate();
        if is_rotation_due(cert.not_before(), cert.not_after(), now) {
            self.authority.compare_and_swap(current, current.record.begin_rotation(now)).await?;
            self.metrics.record_rotation_phase("started");
            info!(serial = %active.serial(), not_after = %cert.not_after(), "CA rotation started");
            return Ok(Step::Advanced(RotationOutcome::RotationStarted));
        }

        self.publish().await?;
        Ok(Step::Idle)
    }

    async fn on_rotating(
        &self,
        current: &VersionedState,
        active: &CertificateAuthority,
        now: OffsetDateTime,
    ) -> Result<Step> {
        let generation = current.record.generation;
        let recorded_next = current.record.next_serial.as_deref();

        let next = match self.authority.load_next().await? {
            Some(next) if next.serial() != active.serial() && recorded_next.map_or(true, |s| s == next.serial()) => next,
            stale => {
                if let Some(stale) = &stale {
                    warn!(serial = %stale.serial(), "Discarding replacement CA that does not match the state record");
                }
                // Generation failure leaves the record untouched; the next tick retries.
                let next = active.replacement(self.ca_validity, now)?;
                self.authority.write_next(&next, generation, stale.as_ref().map(|s| s.serial())).await?;
                info!(serial = %next.serial(), subject = %next.certificate().subject(), "Replacement CA persisted");
                next
            }
        };

        let old_not_after = active.certificate().not_after();
        if now > old_not_after {
            // No bridge can be signed by an expired CA; cut over straight away.
            warn!(
                serial = %active.serial(),
                not_after = %old_not_after,
                next_serial = %next.serial(),
                "Active CA has expired; promoting the replacement without a cross-signed bridge"
            );
            let record = if recorded_next == Some(next.serial()) {
                current.record.begin_retirement(now)
            } else {
                current.record.with_overlap(next.serial(), now, now).begin_retirement(now)
            };
            self.authority.compare_and_swap(current, record).await?;
            self.metrics.record_rotation_phase("retiring");
            return Ok(Step::Advanced(RotationOutcome::RetirementStarted));
        }

        let bridged = self
            .authority
            .load_cross_signed()
            .await?
            .is_some_and(|pair| pair.bridges(active.certificate(), next.certificate()));
        if !bridged {
            let pair = cross_sign(active.certificate(), active.key(), next.certificate(), next.key())?;
            self.authority.write_cross_signed(&pair, generation).await?;
            debug!(
                old_signed_by_new = %pair.old_signed_by_new.serial(),
                new_signed_by_old = %pair.new_signed_by_old.serial(),
                "Cross-signed pair persisted"
            );
        }

        if recorded_next != Some(next.serial()) {
            let ends_at = overlap_end(now, self.overlap_window, old_not_after);
            if ends_at < now + self.overlap_window {
                warn!(
                    serial = %active.serial(),
                    not_after = %old_not_after,
                    overlap_ends_at = %ends_at,
                    "Outgoing CA expires before a full overlap window; shortening the overlap"
                );
            }
            let record = current.record.with_overlap(next.serial(), ends_at, now);
            self.authority.compare_and_swap(current, record).await?;
            self.publish().await?;
            self.metrics.record_rotation_phase("overlap");
            info!(next_serial = %next.serial(), overlap_ends_at = %ends_at, "Overlap window opened");
            return Ok(Step::Advanced(RotationOutcome::OverlapPublished {
                next_serial: next.serial().to_string(),
                overlap_ends_at: ends_at,
            }));
        }

        match current.record.overlap_ends_at() {
            Some(ends_at) if now >= ends_at => {
                self.authority.compare_and_swap(current, current.record.begin_retirement(now)).await?;
                self.metrics.record_rotation_phase("retiring");
                info!(next_serial = %next.serial(), "Overlap window closed; retiring the old CA");
                Ok(Step::Advanced(RotationOutcome::RetirementStarted))
            }
            _ => {
                self.publish().await?;
                Ok(Step::Idle)
            }
        }
    }

    async fn on_retiring(
        &self,
        current: &VersionedState,
        active: &CertificateAuthority,
        now: OffsetDateTime,
    ) -> Result<Step> {
        let generation = current.record.generation;
        let Some(next_serial) = current.record.next_serial.clone() else {
            warn!("Retiring without a recorded replacement CA; restarting rotation");
            self.authority.compare_and_swap(current, current.record.begin_rotation(now)).await?;
            return Ok(Step::Advanced(RotationOutcome::RotationStarted));
        };

        if active.serial() != next_serial {
            match self.authority.load_next().await? {
                Some(next) if next.serial() == next_serial => {
                    self.authority.promote(&next, generation).await?;
                    info!(serial = %next_serial, "Replacement CA promoted to active");
                }
                _ => {
                    warn!(serial = %next_serial, "Replacement CA material lost before promotion; restarting rotation");
                    self.authority.compare_and_swap(current, current.record.begin_rotation(now)).await?;
                    return Ok(Step::Advanced(RotationOutcome::RotationStarted));
                }
            }
        }

        self.authority.discard_rotation_material().await?;
        self.publish().await?;

        let record = current.record.complete_rotation(next_serial.clone(), now);
        self.authority.compare_and_swap(current, record).await?;
        self.metrics.record_rotation_phase("completed");
        info!(serial = %next_serial, "CA rotation completed");
        Ok(Step::Advanced(RotationOutcome::Completed { active_serial: next_serial }))
    }

    async fn publish(&self) -> Result<()> {
        let snapshot = self.authority.snapshot().await?;
        self.authority.publish_bundle(&snapshot).await?;
        Ok(())
    }

    /// Reconcile on every tick until `shutdown` fires. Shutdown is observed
    /// only between reconciles.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "CA rotation controller started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.reconcile(OffsetDateTime::now_utc()).await {
                Ok(outcome) if outcome.is_transition() => debug!(?outcome, "CA rotation advanced"),
                Ok(_) => {}
                Err(e) => {
                    self.metrics.record_error(e.kind());
                    error!(error = %e, "CA rotation reconcile failed");
                }
            }
        }
        info!("CA rotation controller stopped");
    }
}

/// End of the overlap window: `overlap` after `now`, but never later than
/// `RETIREMENT_MARGIN` before the outgoing CA expires, and never before `now`.
fn overlap_end(now: OffsetDateTime, overlap: Duration, old_not_after: OffsetDateTime) -> OffsetDateTime {
    (now + overlap).min(old_not_after - RETIREMENT_MARGIN).max(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::KeyAlgorithm;
    use crate::retry::RetryConfig;
    use crate::storage::{InMemorySecretStore, SecretStore};
    use tracing_test::traced_test;

    const CA_DAYS: i64 = 40;
    const OVERLAP_DAYS: i64 = 10;

    async fn setup(start: OffsetDateTime) -> (Arc<InMemorySecretStore>, Arc<CaRepository>, CaRotationController) {
        let store = Arc::new(InMemorySecretStore::new());
        let retry = RetryConfig::default().with_max_attempts(1);
        let authority = Arc::new(CaRepository::from_settings(store.clone(), &SignerSettings::default(), retry));
        let ca = CertificateAuthority::generate("signer@1", KeyAlgorithm::EcdsaP256, Duration::days(CA_DAYS), start)
            .unwrap();
        authority.bootstrap(|| Ok(ca), start).await.unwrap();
        let controller = CaRotationController::new(
            authority.clone(),
            Duration::days(CA_DAYS),
            Duration::days(OVERLAP_DAYS),
            StdDuration::from_secs(60),
        );
        (store, authority, controller)
    }

    #[tokio::test]
    async fn test_no_rotation_before_midpoint() {
        let start = OffsetDateTime::now_utc();
        let (_, authority, controller) = setup(start).await;

        let outcome = controller.reconcile(start + Duration::days(5)).await.unwrap();
        assert_eq!(outcome, RotationOutcome::Steady);
        assert_eq!(authority.load_state().await.unwrap().unwrap().record.status, CaStatus::Active);
    }

    #[tokio::test]
    async fn test_full_rotation_cycle() {
        let start = OffsetDateTime::now_utc();
        let (_, authority, controller) = setup(start).await;
        let old = authority.load_active().await.unwrap().unwrap();

        let due = start + Duration::days(CA_DAYS / 2 + 1);
        let outcome = controller.reconcile(due).await.unwrap();
        let RotationOutcome::OverlapPublished { next_serial, overlap_ends_at } = outcome else {
            panic!("expected overlap, got {:?}", outcome);
        };
        assert_eq!(overlap_ends_at, due + Duration::days(OVERLAP_DAYS));

        let snapshot = authority.snapshot().await.unwrap();
        assert_eq!(snapshot.state.status, CaStatus::Rotating);
        assert_eq!(snapshot.active, old);
        let next = snapshot.next.clone().unwrap();
        assert_eq!(next.serial(), next_serial);
        assert_eq!(next.certificate().subject(), old.certificate().subject());
        assert!(snapshot.cross_signed.is_some());
        assert_eq!(crate::pki::decode_chain(&authority.current_bundle()).unwrap().len(), 4);

        // Mid-overlap ticks are idempotent.
        let writes_mid = controller.reconcile(due + Duration::days(1)).await.unwrap();
        assert_eq!(writes_mid, RotationOutcome::Steady);

        let outcome = controller.reconcile(overlap_ends_at).await.unwrap();
        assert_eq!(outcome, RotationOutcome::Completed { active_serial: next_serial.clone() });

        let snapshot = authority.snapshot().await.unwrap();
        assert_eq!(snapshot.state.status, CaStatus::Active);
        assert_eq!(snapshot.state.active_serial, next_serial);
        assert_eq!(snapshot.active, next);
        assert!(authority.load_next().await.unwrap().is_none());
        assert!(authority.load_cross_signed().await.unwrap().is_none());
        assert_eq!(crate::pki::decode_chain(&authority.current_bundle()).unwrap(), vec![next.certificate().clone()]);
    }

    #[tokio::test]
    async fn test_concurrent_rotation_starts_once() {
        let start = OffsetDateTime::now_utc();
        let (_, authority, controller) = setup(start).await;
        let other = CaRotationController::new(
            authority.clone(),
            Duration::days(CA_DAYS),
            Duration::days(OVERLAP_DAYS),
            StdDuration::from_secs(60),
        );

        let due = start + Duration::days(CA_DAYS / 2 + 1);
        let (a, b) = tokio::join!(controller.reconcile(due), other.reconcile(due));
        let outcomes = [a.unwrap(), b.unwrap()];
        assert!(outcomes.iter().any(|o| matches!(o, RotationOutcome::OverlapPublished { .. })
            || matches!(o, RotationOutcome::Conflict { .. })));

        // Whatever interleaving happened, the record converges on a single replacement CA.
        controller.reconcile(due).await.unwrap();
        let snapshot = authority.snapshot().await.unwrap();
        let next = snapshot.next.unwrap();
        assert_eq!(snapshot.state.next_serial.as_deref(), Some(next.serial()));
        assert!(snapshot
            .cross_signed
            .unwrap()
            .bridges(snapshot.active.certificate(), next.certificate()));
    }

    #[tokio::test]
    async fn test_store_failure_mid_rotation_is_retried() {
        let start = OffsetDateTime::now_utc();
        let (store, authority, controller) = setup(start).await;
        let old = authority.load_active().await.unwrap().unwrap();

        let due = start + Duration::days(CA_DAYS / 2 + 1);
        let state = authority.load_state().await.unwrap().unwrap();
        authority.compare_and_swap(&state, state.record.begin_rotation(due)).await.unwrap();

        store.fail_next(1);
        assert!(controller.reconcile(due).await.unwrap_err().is_transient());
        assert_eq!(authority.load_active().await.unwrap().unwrap(), old);
        assert_eq!(authority.load_state().await.unwrap().unwrap().record.status, CaStatus::Rotating);
        assert!(authority.load_next().await.unwrap().is_none());

        let outcome = controller.reconcile(due).await.unwrap();
        assert!(matches!(outcome, RotationOutcome::OverlapPublished { .. }));
        assert_eq!(authority.load_active().await.unwrap().unwrap(), old);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_externally_replaced_ca_is_adopted() {
        let start = OffsetDateTime::now_utc();
        let (store, authority, controller) = setup(start).await;

        let replacement =
            CertificateAuthority::generate("signer@2", KeyAlgorithm::EcdsaP256, Duration::days(CA_DAYS), start).unwrap();
        let mut secret = store.get_secret("service-ca", "signing-key").await.unwrap().unwrap();
        secret.data = replacement.to_secret_data().unwrap();
        store.update_secret(secret).await.unwrap();

        let outcome = controller.reconcile(start).await.unwrap();
        assert_eq!(outcome, RotationOutcome::Adopted { serial: replacement.serial().to_string() });
        assert_eq!(authority.load_state().await.unwrap().unwrap().record.active_serial, replacement.serial());
        assert!(logs_contain("Active CA was replaced outside rotation"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_late_rotation_closes_overlap_before_old_ca_expires() {
        let start = OffsetDateTime::now_utc();
        let (_, authority, controller) = setup(start).await;
        let old = authority.load_active().await.unwrap().unwrap();
        let old_not_after = old.certificate().not_after();

        let late = start + Duration::days(CA_DAYS - 5);
        let outcome = controller.reconcile(late).await.unwrap();
        let RotationOutcome::OverlapPublished { next_serial, overlap_ends_at } = outcome else {
            panic!("expected overlap, got {:?}", outcome);
        };
        assert!(overlap_ends_at > late);
        assert!(overlap_ends_at <= old_not_after - RETIREMENT_MARGIN);
        assert!(logs_contain("shortening the overlap"));

        let outcome = controller.reconcile(overlap_ends_at).await.unwrap();
        assert_eq!(outcome, RotationOutcome::Completed { active_serial: next_serial.clone() });
        let active = authority.load_active().await.unwrap().unwrap();
        assert_eq!(active.serial(), next_serial);
        assert!(active.certificate().not_before() <= overlap_ends_at);
        assert!(active.certificate().not_after() > old_not_after);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_expired_ca_is_replaced_without_bridge() {
        for days_late in [1, 20] {
            let start = OffsetDateTime::now_utc();
            let (_, authority, controller) = setup(start).await;
            let old = authority.load_active().await.unwrap().unwrap();

            let now = start + Duration::days(CA_DAYS + days_late);
            let outcome = controller.reconcile(now).await.unwrap();
            let RotationOutcome::Completed { active_serial } = outcome else {
                panic!("expected completed rotation {} days after expiry, got {:?}", days_late, outcome);
            };

            let snapshot = authority.snapshot().await.unwrap();
            assert_eq!(snapshot.state.status, CaStatus::Active);
            assert_eq!(snapshot.active.serial(), active_serial);
            assert_ne!(snapshot.active, old);
            assert!(snapshot.active.certificate().not_after() > now);
            assert!(authority.load_next().await.unwrap().is_none());
            assert!(authority.load_cross_signed().await.unwrap().is_none());

            // Converged: the following tick owes nothing.
            assert_eq!(controller.reconcile(now).await.unwrap(), RotationOutcome::Steady);
        }
        assert!(logs_contain("promoting the replacement without a cross-signed bridge"));
    }

    #[tokio::test]
    async fn test_failed_replacement_generation_is_retried() {
        let start = OffsetDateTime::now_utc();
        let (_, authority, controller) = setup(start).await;
        let broken = CaRotationController::new(
            authority.clone(),
            Duration::ZERO,
            Duration::days(OVERLAP_DAYS),
            StdDuration::from_secs(60),
        );

        let due = start + Duration::days(CA_DAYS / 2 + 1);
        let err = broken.reconcile(due).await.unwrap_err();
        assert!(matches!(err, Error::Template(_)));
        let state = authority.load_state().await.unwrap().unwrap();
        assert_eq!(state.record.status, CaStatus::Rotating);
        assert_eq!(state.record.next_serial, None);
        assert!(authority.load_next().await.unwrap().is_none());

        let outcome = controller.reconcile(due).await.unwrap();
        assert!(matches!(outcome, RotationOutcome::OverlapPublished { .. }));
    }

    #[tokio::test]
    async fn test_replacement_written_by_another_attempt_is_reused() {
        let start = OffsetDateTime::now_utc();
        let (_, authority, controller) = setup(start).await;
        let old = authority.load_active().await.unwrap().unwrap();

        let due = start + Duration::days(CA_DAYS / 2 + 1);
        let state = authority.load_state().await.unwrap().unwrap();
        let state = authority.compare_and_swap(&state, state.record.begin_rotation(due)).await.unwrap();
        let claimed = old.replacement(Duration::days(CA_DAYS), due).unwrap();
        authority.write_next(&claimed, state.record.generation, None).await.unwrap();

        let outcome = controller.reconcile(due).await.unwrap();
        let RotationOutcome::OverlapPublished { next_serial, .. } = outcome else {
            panic!("expected overlap, got {:?}", outcome);
        };
        assert_eq!(next_serial, claimed.serial());
        assert_eq!(authority.load_next().await.unwrap(), Some(claimed));
    }
}
