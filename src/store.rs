use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::models::{
    Alert, Cycle, CycleInsert, LabValues, ProgressionProfile, Recommendation, Transition,
    TreatmentContext,
};

/// Persistence collaborator for the progression engine. Implementations must
/// make `create_profile_if_absent` and `create_cycle` atomic conditional inserts.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn patient_exists(&self, patient_id: Uuid) -> Result<bool>;
    async fn list_patient_ids(&self) -> Result<Vec<Uuid>>;
    async fn get_latest_lab_values(&self, patient_id: Uuid) -> Result<Option<LabValues>>;
    async fn get_treatment_context(&self, patient_id: Uuid) -> Result<TreatmentContext>;

    async fn get_profile(&self, patient_id: Uuid) -> Result<Option<ProgressionProfile>>;
    /// Inserts unless a profile already exists; always returns the stored one.
    async fn create_profile_if_absent(&self, profile: ProgressionProfile) -> Result<ProgressionProfile>;

    async fn get_cycle(&self, patient_id: Uuid, cycle_number: i32) -> Result<Option<Cycle>>;
    /// Unique on `(patient_id, cycle_number)`. Cycle N > 0 requires N - 1.
    async fn create_cycle(&self, cycle: Cycle) -> Result<CycleInsert>;
    async fn list_cycles(&self, patient_id: Uuid) -> Result<Vec<Cycle>>;

    async fn get_transition(&self, patient_id: Uuid, to_cycle: i32) -> Result<Option<Transition>>;
    async fn create_transition(&self, transition: Transition) -> Result<Transition>;
    async fn list_transitions(&self, patient_id: Uuid) -> Result<Vec<Transition>>;

    async fn create_alert(&self, alert: Alert) -> Result<Alert>;
    async fn list_alerts(&self, patient_id: Uuid) -> Result<Vec<Alert>>;

    async fn create_recommendation(&self, recommendation: Recommendation) -> Result<Recommendation>;
    async fn list_recommendations(&self, patient_id: Uuid) -> Result<Vec<Recommendation>>;
}

#[derive(Default)]
struct Tables {
    patients: HashSet<Uuid>,
    labs: HashMap<Uuid, LabValues>,
    treatments: HashMap<Uuid, TreatmentContext>,
    profiles: HashMap<Uuid, ProgressionProfile>,
    cycles: HashMap<Uuid, BTreeMap<i32, Cycle>>,
    transitions: HashMap<Uuid, BTreeMap<i32, Transition>>,
    alerts: Vec<Alert>,
    recommendations: Vec<Recommendation>,
}

/// Process-local storage used by tests and `--in-memory` runs.
#[derive(Default)]
pub struct InMemoryStorage {
    tables: Mutex<Tables>,
    fail_secondary_writes: AtomicBool,
    fail_next_transition: AtomicBool,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_patient(&self, patient_id: Uuid, labs: Option<LabValues>, treatment: TreatmentContext) {
        let mut tables = self.tables.lock().await;
        tables.patients.insert(patient_id);
        if let Some(labs) = labs {
            tables.labs.insert(patient_id, labs);
        }
        tables.treatments.insert(patient_id, treatment);
    }

    /// Makes alert and recommendation writes fail until reset.
    pub fn set_fail_secondary_writes(&self, fail: bool) {
        self.fail_secondary_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes the next transition write fail once.
    pub fn fail_next_transition_write(&self) {
        self.fail_next_transition.store(true, Ordering::SeqCst);
    }

    fn check_secondary(&self, what: &str) -> Result<()> {
        if self.fail_secondary_writes.load(Ordering::SeqCst) {
            return Err(EngineError::Unavailable(format!("{what} write rejected")));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn patient_exists(&self, patient_id: Uuid) -> Result<bool> {
        Ok(self.tables.lock().await.patients.contains(&patient_id))
    }

    async fn list_patient_ids(&self) -> Result<Vec<Uuid>> {
        let mut ids: Vec<Uuid> = self.tables.lock().await.patients.iter().copied().collect();
        ids.sort();
        Ok(ids)
    }

    async fn get_latest_lab_values(&self, patient_id: Uuid) -> Result<Option<LabValues>> {
        Ok(self.tables.lock().await.labs.get(&patient_id).copied())
    }

    async fn get_treatment_context(&self, patient_id: Uuid) -> Result<TreatmentContext> {
        Ok(self
            .tables
            .lock()
            .await
            .treatments
            .get(&patient_id)
            .copied()
            .unwrap_or_default())
    }

    async fn get_profile(&self, patient_id: Uuid) -> Result<Option<ProgressionProfile>> {
        Ok(self.tables.lock().await.profiles.get(&patient_id).cloned())
    }

    async fn create_profile_if_absent(&self, profile: ProgressionProfile) -> Result<ProgressionProfile> {
        let mut tables = self.tables.lock().await;
        Ok(tables
            .profiles
            .entry(profile.patient_id)
            .or_insert(profile)
            .clone())
    }

    async fn get_cycle(&self, patient_id: Uuid, cycle_number: i32) -> Result<Option<Cycle>> {
        Ok(self
            .tables
            .lock()
            .await
            .cycles
            .get(&patient_id)
            .and_then(|cycles| cycles.get(&cycle_number))
            .cloned())
    }

    async fn create_cycle(&self, cycle: Cycle) -> Result<CycleInsert> {
        let mut tables = self.tables.lock().await;
        let cycles = tables.cycles.entry(cycle.patient_id).or_default();

        if let Some(existing) = cycles.get(&cycle.cycle_number) {
            return Ok(CycleInsert::Existing(existing.clone()));
        }
        if cycle.cycle_number > 0 && !cycles.contains_key(&(cycle.cycle_number - 1)) {
            return Err(EngineError::SequenceGap {
                patient_id: cycle.patient_id,
                requested: cycle.cycle_number,
                missing: cycle.cycle_number - 1,
            });
        }

        cycles.insert(cycle.cycle_number, cycle.clone());
        Ok(CycleInsert::Created(cycle))
    }

    async fn list_cycles(&self, patient_id: Uuid) -> Result<Vec<Cycle>> {
        Ok(self
            .tables
            .lock()
            .await
            .cycles
            .get(&patient_id)
            .map(|cycles| cycles.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_transition(&self, patient_id: Uuid, to_cycle: i32) -> Result<Option<Transition>> {
        Ok(self
            .tables
            .lock()
            .await
            .transitions
            .get(&patient_id)
            .and_then(|transitions| transitions.get(&to_cycle))
            .cloned())
    }

    async fn create_transition(&self, transition: Transition) -> Result<Transition> {
        if self.fail_next_transition.swap(false, Ordering::SeqCst) {
            return Err(EngineError::Unavailable("transition write rejected".to_string()));
        }
        let mut tables = self.tables.lock().await;
        Ok(tables
            .transitions
            .entry(transition.patient_id)
            .or_default()
            .entry(transition.to_cycle)
            .or_insert(transition)
            .clone())
    }

    async fn list_transitions(&self, patient_id: Uuid) -> Result<Vec<Transition>> {
        Ok(self
            .tables
            .lock()
            .await
            .transitions
            .get(&patient_id)
            .map(|transitions| transitions.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn create_alert(&self, alert: Alert) -> Result<Alert> {
        self.check_secondary("alert")?;
        self.tables.lock().await.alerts.push(alert.clone());
        Ok(alert)
    }

    async fn list_alerts(&self, patient_id: Uuid) -> Result<Vec<Alert>> {
        Ok(self
            .tables
            .lock()
            .await
            .alerts
            .iter()
            .filter(|alert| alert.patient_id == patient_id)
            .cloned()
            .collect())
    }

    async fn create_recommendation(&self, recommendation: Recommendation) -> Result<Recommendation> {
        self.check_secondary("recommendation")?;
        self.tables
            .lock()
            .await
            .recommendations
            .push(recommendation.clone());
        Ok(recommendation)
    }

    async fn list_recommendations(&self, patient_id: Uuid) -> Result<Vec<Recommendation>> {
        Ok(self
            .tables
            .lock()
            .await
            .recommendations
            .iter()
            .filter(|recommendation| recommendation.patient_id == patient_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::risk::classify;

    fn cycle(patient_id: Uuid, cycle_number: i32, egfr: f64) -> Cycle {
        Cycle {
            patient_id,
            cycle_number,
            egfr_value: egfr,
            uacr_value: 20.0,
            classification: classify(egfr, Some(20.0)),
            measured_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn cycle_insert_enforces_monotonic_sequence() {
        let storage = InMemoryStorage::new();
        let patient = Uuid::new_v4();

        let gap = storage.create_cycle(cycle(patient, 1, 60.0)).await;
        assert!(matches!(gap, Err(EngineError::SequenceGap { requested: 1, missing: 0, .. })));
        assert!(storage.list_cycles(patient).await.unwrap().is_empty());

        assert!(matches!(
            storage.create_cycle(cycle(patient, 0, 60.0)).await.unwrap(),
            CycleInsert::Created(_)
        ));
        match storage.create_cycle(cycle(patient, 0, 10.0)).await.unwrap() {
            CycleInsert::Existing(existing) => assert_eq!(existing.egfr_value, 60.0),
            CycleInsert::Created(_) => panic!("duplicate cycle inserted"),
        }
    }

    #[tokio::test]
    async fn secondary_writes_can_be_forced_to_fail() {
        let storage = InMemoryStorage::new();
        storage.set_fail_secondary_writes(true);
        assert!(storage.check_secondary("alert").is_err());
        storage.set_fail_secondary_writes(false);
        assert!(storage.check_secondary("alert").is_ok());
    }
}
