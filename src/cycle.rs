use std::sync::Arc;

use chrono::{DateTime, Months, Utc};
use rand::Rng;
use uuid::Uuid;

use crate::alerts::{build_alert, derive_recommendations};
use crate::compare::compare;
use crate::error::{EngineError, Result};
use crate::models::{Alert, Cycle, CycleInsert, CycleResult, ProgressionProfile, Severity, Transition};
use crate::profile::get_or_create_profile;
use crate::risk::classify;
use crate::sim::uniform;
use crate::store::Storage;

/// Simulated lab values never drop below this floor.
pub const VALUE_FLOOR: f64 = 5.0;
const EGFR_NOISE: f64 = 1.0;
const UACR_NOISE: f64 = 0.05;

/// Draws the next simulated measurement. Consumes two samples: eGFR noise,
/// then uACR noise.
pub fn simulate_next_values<R: Rng + ?Sized>(
    profile: &ProgressionProfile,
    previous_egfr: f64,
    previous_uacr: f64,
    rng: &mut R,
) -> (f64, f64) {
    let egfr = previous_egfr + profile.egfr_rate + uniform(rng, -EGFR_NOISE, EGFR_NOISE);
    let uacr = previous_uacr * (1.0 + profile.uacr_rate + uniform(rng, -UACR_NOISE, UACR_NOISE));
    (egfr.max(VALUE_FLOOR), uacr.max(VALUE_FLOOR))
}

/// One cycle is one month after the profile was created.
pub fn cycle_timestamp(profile: &ProgressionProfile, cycle_number: i32) -> DateTime<Utc> {
    u32::try_from(cycle_number)
        .ok()
        .and_then(|months| profile.created_at.checked_add_months(Months::new(months)))
        .unwrap_or_else(Utc::now)
}

/// Advances patients through simulated follow-up cycles.
pub struct ProgressionEngine<S: ?Sized> {
    storage: Arc<S>,
}

impl<S: ?Sized> Clone for ProgressionEngine<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
        }
    }
}

impl<S> ProgressionEngine<S>
where
    S: Storage + ?Sized,
{
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &S {
        self.storage.as_ref()
    }

    /// Materialises cycle 0 from the patient's profile, creating the profile
    /// on first use. Idempotent.
    pub async fn initialize_baseline<R>(&self, patient_id: Uuid, rng: &mut R) -> Result<CycleResult>
    where
        R: Rng + ?Sized + Send,
    {
        if !self.storage.patient_exists(patient_id).await? {
            return Err(EngineError::not_found("patient", patient_id));
        }
        if let Some(existing) = self.storage.get_cycle(patient_id, 0).await? {
            log::debug!("baseline already recorded for patient {patient_id}");
            return Ok(CycleResult::from_cycle(existing, None, true));
        }

        let profile = get_or_create_profile(self.storage.as_ref(), patient_id, rng).await?;
        let baseline = Cycle {
            patient_id,
            cycle_number: 0,
            egfr_value: profile.baseline_egfr,
            uacr_value: profile.baseline_uacr,
            classification: classify(profile.baseline_egfr, Some(profile.baseline_uacr)),
            measured_at: profile.created_at,
        };

        match self.storage.create_cycle(baseline).await? {
            CycleInsert::Created(cycle) => {
                log::info!(
                    "recorded baseline for patient {patient_id}: {} (egfr {:.1}, uacr {:.1})",
                    cycle.classification.health_state,
                    cycle.egfr_value,
                    cycle.uacr_value
                );
                Ok(CycleResult::from_cycle(cycle, None, false))
            }
            CycleInsert::Existing(cycle) => Ok(CycleResult::from_cycle(cycle, None, true)),
        }
    }

    /// Produces cycle `current_cycle + 1`. Repeating the call for a cycle that
    /// already exists returns the stored record without drawing new values.
    pub async fn generate_next_cycle<R>(
        &self,
        patient_id: Uuid,
        current_cycle: i32,
        rng: &mut R,
    ) -> Result<CycleResult>
    where
        R: Rng + ?Sized + Send,
    {
        if current_cycle < 0 {
            return Err(EngineError::InvalidCycle(current_cycle));
        }
        let next_cycle = current_cycle
            .checked_add(1)
            .ok_or(EngineError::InvalidCycle(current_cycle))?;

        if let Some(existing) = self.storage.get_cycle(patient_id, next_cycle).await? {
            return self.replay(existing).await;
        }

        let previous = match self.storage.get_cycle(patient_id, current_cycle).await? {
            Some(cycle) => cycle,
            None if current_cycle == 0 => {
                self.initialize_baseline(patient_id, rng).await?;
                self.storage
                    .get_cycle(patient_id, 0)
                    .await?
                    .ok_or_else(|| EngineError::not_found("cycle", format!("{patient_id}/0")))?
            }
            None => {
                if !self.storage.patient_exists(patient_id).await? {
                    return Err(EngineError::not_found("patient", patient_id));
                }
                return Err(EngineError::SequenceGap {
                    patient_id,
                    requested: next_cycle,
                    missing: current_cycle,
                });
            }
        };

        let profile = self
            .storage
            .get_profile(patient_id)
            .await?
            .ok_or_else(|| EngineError::not_found("progression profile", patient_id))?;

        let (egfr, uacr) =
            simulate_next_values(&profile, previous.egfr_value, previous.uacr_value, rng);
        let candidate = Cycle {
            patient_id,
            cycle_number: next_cycle,
            egfr_value: egfr,
            uacr_value: uacr,
            classification: classify(egfr, Some(uacr)),
            measured_at: cycle_timestamp(&profile, next_cycle),
        };

        let cycle = match self.storage.create_cycle(candidate).await? {
            CycleInsert::Created(cycle) => cycle,
            CycleInsert::Existing(existing) => return self.replay(existing).await,
        };
        log::info!(
            "patient {patient_id} cycle {next_cycle}: {} (egfr {:.1}, uacr {:.1})",
            cycle.classification.health_state,
            cycle.egfr_value,
            cycle.uacr_value
        );

        self.record_transition(&previous, cycle, false).await
    }

    /// Returns a stored cycle. A missing transition is recomputed against the
    /// previous cycle, since an earlier attempt may have failed after the cycle
    /// write.
    async fn replay(&self, existing: Cycle) -> Result<CycleResult> {
        let patient_id = existing.patient_id;
        log::debug!(
            "cycle {} for patient {patient_id} already materialised; returning stored record",
            existing.cycle_number
        );
        if let Some(transition) = self
            .storage
            .get_transition(patient_id, existing.cycle_number)
            .await?
        {
            return Ok(CycleResult::from_cycle(existing, Some(transition), true));
        }
        if existing.cycle_number == 0 {
            return Ok(CycleResult::from_cycle(existing, None, true));
        }

        let previous_number = existing.cycle_number - 1;
        let previous = self
            .storage
            .get_cycle(patient_id, previous_number)
            .await?
            .ok_or_else(|| EngineError::not_found("cycle", format!("{patient_id}/{previous_number}")))?;
        self.record_transition(&previous, existing, true).await
    }

    /// Persists the transition into `cycle` if the state changed. Only the
    /// caller whose transition row was stored raises the alert.
    async fn record_transition(&self, previous: &Cycle, cycle: Cycle, replayed: bool) -> Result<CycleResult> {
        let comparison = compare(&previous.classification, &cycle.classification);
        if !comparison.has_changed {
            return Ok(CycleResult::from_cycle(cycle, None, replayed));
        }

        let candidate_id = Uuid::new_v4();
        let transition = self
            .storage
            .create_transition(Transition {
                id: candidate_id,
                patient_id: cycle.patient_id,
                from_cycle: previous.cycle_number,
                to_cycle: cycle.cycle_number,
                from_classification: previous.classification.clone(),
                to_classification: cycle.classification.clone(),
                change_type: comparison.change_type,
                gfr_change: comparison.gfr_change,
                uacr_change: comparison.uacr_change,
                category_changed: comparison.category_changed,
                risk_increased: comparison.risk_increased,
                crossed_critical_threshold: comparison.crossed_critical_threshold,
                alert_generated: comparison.needs_alert(),
                alert_severity: comparison.alert_severity(),
                detected_at: Utc::now(),
            })
            .await?;
        if transition.id != candidate_id {
            return Ok(CycleResult::from_cycle(cycle, Some(transition), replayed));
        }
        log::info!(
            "patient {} transition {} -> {}: {} ({} -> {})",
            transition.patient_id,
            transition.from_cycle,
            transition.to_cycle,
            transition.change_type,
            transition.from_classification.health_state,
            transition.to_classification.health_state
        );

        let mut warnings = Vec::new();
        if let Some(alert) = build_alert(&transition, comparison.reasons) {
            if let Err(err) = self.raise_alert(&transition, alert).await {
                log::error!(
                    "alert derivation failed for patient {} cycle {}: {err}",
                    transition.patient_id,
                    transition.to_cycle
                );
                warnings.push(format!("alert not recorded: {err}"));
            }
        }

        let mut result = CycleResult::from_cycle(cycle, Some(transition), replayed);
        result.warnings = warnings;
        Ok(result)
    }

    /// Best-effort: the cycle and transition are already persisted.
    async fn raise_alert(&self, transition: &Transition, alert: Alert) -> Result<()> {
        let alert = self.storage.create_alert(alert).await?;
        if alert.severity == Severity::Critical {
            log::warn!("critical alert for patient {}: {}", alert.patient_id, alert.title);
        } else {
            log::info!("{} alert for patient {}: {}", alert.severity, alert.patient_id, alert.title);
        }

        let treatment = self.storage.get_treatment_context(transition.patient_id).await?;
        let recommendations = derive_recommendations(
            transition.patient_id,
            Some(alert.id),
            transition.change_type,
            &transition.to_classification,
            treatment,
        );
        for recommendation in recommendations {
            self.storage.create_recommendation(recommendation).await?;
        }
        Ok(())
    }
}
