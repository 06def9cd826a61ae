use chrono::Utc;
use rand::Rng;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{LabValues, ProgressionProfile, ProgressionType};
use crate::sim::uniform;
use crate::store::Storage;

pub const DEFAULT_BASELINE_EGFR: f64 = 60.0;
pub const DEFAULT_BASELINE_UACR: f64 = 20.0;

/// Cumulative thresholds on a uniform draw: 5% rapid, 15% improving,
/// 15% progressive, the rest stable.
const TYPE_THRESHOLDS: [(f64, ProgressionType); 3] = [
    (0.05, ProgressionType::Rapid),
    (0.20, ProgressionType::Improving),
    (0.35, ProgressionType::Progressive),
];

pub fn progression_type_for(draw: f64) -> ProgressionType {
    TYPE_THRESHOLDS
        .iter()
        .find(|(threshold, _)| draw < *threshold)
        .map(|(_, kind)| *kind)
        .unwrap_or(ProgressionType::Stable)
}

/// `(egfr units/month, uacr fraction/month)` ranges per trajectory type.
pub fn rate_ranges(kind: ProgressionType) -> ((f64, f64), (f64, f64)) {
    match kind {
        ProgressionType::Rapid => ((-1.00, -0.67), (0.03, 0.08)),
        ProgressionType::Improving => ((0.02, 0.05), (-0.05, -0.02)),
        ProgressionType::Progressive => ((-0.50, -0.25), (0.01, 0.03)),
        ProgressionType::Stable => ((-0.12, -0.04), (-0.015, -0.005)),
    }
}

/// Draws a fresh profile. Consumes three samples: type, eGFR rate, uACR rate.
pub fn draw_profile<R: Rng + ?Sized>(
    patient_id: Uuid,
    labs: Option<LabValues>,
    rng: &mut R,
) -> ProgressionProfile {
    let progression_type = progression_type_for(rng.random::<f64>());
    let ((egfr_low, egfr_high), (uacr_low, uacr_high)) = rate_ranges(progression_type);
    let egfr_rate = uniform(rng, egfr_low, egfr_high);
    let uacr_rate = uniform(rng, uacr_low, uacr_high);

    let baseline_egfr = labs.map_or(DEFAULT_BASELINE_EGFR, |labs| labs.egfr);
    let baseline_uacr = labs
        .and_then(|labs| labs.uacr)
        .unwrap_or(DEFAULT_BASELINE_UACR);

    ProgressionProfile {
        patient_id,
        progression_type,
        baseline_egfr,
        baseline_uacr,
        egfr_rate,
        uacr_rate,
        created_at: Utc::now(),
    }
}

/// Storage may round `created_at`, so a stored profile is matched to the
/// candidate by its drawn trajectory.
fn same_draw(stored: &ProgressionProfile, candidate: &ProgressionProfile) -> bool {
    stored.progression_type == candidate.progression_type
        && stored.egfr_rate == candidate.egfr_rate
        && stored.uacr_rate == candidate.uacr_rate
}

/// Returns the patient's profile, creating it on first use. Concurrent callers
/// all observe the single stored record.
pub async fn get_or_create_profile<S, R>(
    storage: &S,
    patient_id: Uuid,
    rng: &mut R,
) -> Result<ProgressionProfile>
where
    S: Storage + ?Sized,
    R: Rng + ?Sized + Send,
{
    if let Some(profile) = storage.get_profile(patient_id).await? {
        return Ok(profile);
    }

    let labs = storage.get_latest_lab_values(patient_id).await?;
    let candidate = draw_profile(patient_id, labs, rng);
    let stored = storage.create_profile_if_absent(candidate.clone()).await?;

    if same_draw(&stored, &candidate) {
        log::info!(
            "created {} progression profile for patient {} (egfr rate {:.3}/month, uacr rate {:.4}/month)",
            stored.progression_type,
            patient_id,
            stored.egfr_rate,
            stored.uacr_rate
        );
    } else {
        log::debug!("profile race lost for patient {patient_id}; using stored record");
    }

    Ok(stored)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::DateTime;

    use super::*;
    use crate::models::TreatmentContext;
    use crate::sim::call_rng;
    use crate::sim::testing::ScriptedRng;
    use crate::store::InMemoryStorage;

    #[test]
    fn type_distribution_thresholds() {
        assert_eq!(progression_type_for(0.0), ProgressionType::Rapid);
        assert_eq!(progression_type_for(0.049), ProgressionType::Rapid);
        assert_eq!(progression_type_for(0.05), ProgressionType::Improving);
        assert_eq!(progression_type_for(0.199), ProgressionType::Improving);
        assert_eq!(progression_type_for(0.20), ProgressionType::Progressive);
        assert_eq!(progression_type_for(0.349), ProgressionType::Progressive);
        assert_eq!(progression_type_for(0.35), ProgressionType::Stable);
        assert_eq!(progression_type_for(0.999), ProgressionType::Stable);
    }

    #[test]
    fn rates_stay_inside_type_ranges() {
        for seed in 0..200u64 {
            let profile = draw_profile(Uuid::new_v4(), None, &mut call_rng(Some(seed), Uuid::nil(), 0));
            let ((egfr_low, egfr_high), (uacr_low, uacr_high)) = rate_ranges(profile.progression_type);
            assert!(profile.egfr_rate >= egfr_low && profile.egfr_rate <= egfr_high);
            assert!(profile.uacr_rate >= uacr_low && profile.uacr_rate <= uacr_high);
        }
    }

    #[test]
    fn scripted_draw_is_exact() {
        let labs = LabValues {
            egfr: 48.0,
            uacr: None,
        };
        let mut rng = ScriptedRng::new(&[0.25, 0.5, 0.0]);
        let profile = draw_profile(Uuid::nil(), Some(labs), &mut rng);
        assert_eq!(profile.progression_type, ProgressionType::Progressive);
        assert!((profile.egfr_rate - -0.375).abs() < 1e-12);
        assert!((profile.uacr_rate - 0.01).abs() < 1e-12);
        assert_eq!(profile.baseline_egfr, 48.0);
        assert_eq!(profile.baseline_uacr, DEFAULT_BASELINE_UACR);
    }

    #[test]
    fn stored_profile_with_rounded_timestamp_matches_its_draw() {
        let candidate = draw_profile(Uuid::nil(), None, &mut ScriptedRng::new(&[0.25, 0.5, 0.0]));
        let micros = candidate.created_at.timestamp_micros();
        let stored = ProgressionProfile {
            created_at: DateTime::from_timestamp_micros(micros).unwrap(),
            ..candidate.clone()
        };
        assert!(same_draw(&stored, &candidate));

        let other = draw_profile(Uuid::nil(), None, &mut ScriptedRng::new(&[0.9, 0.5, 0.5]));
        assert!(!same_draw(&other, &candidate));
    }

    #[tokio::test]
    async fn falls_back_to_defaults_without_labs() {
        let storage = InMemoryStorage::new();
        let patient = Uuid::new_v4();
        storage.add_patient(patient, None, TreatmentContext::default()).await;

        let profile = get_or_create_profile(&storage, patient, &mut ScriptedRng::new(&[0.9]))
            .await
            .unwrap();
        assert_eq!(profile.baseline_egfr, DEFAULT_BASELINE_EGFR);
        assert_eq!(profile.baseline_uacr, DEFAULT_BASELINE_UACR);
        assert_eq!(profile.progression_type, ProgressionType::Stable);
    }

    #[tokio::test]
    async fn existing_profile_is_returned_unchanged() {
        let storage = InMemoryStorage::new();
        let patient = Uuid::new_v4();
        let first = get_or_create_profile(&storage, patient, &mut ScriptedRng::new(&[0.01]))
            .await
            .unwrap();
        let second = get_or_create_profile(&storage, patient, &mut ScriptedRng::new(&[0.9]))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(second.progression_type, ProgressionType::Rapid);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creation_yields_one_profile() {
        let storage = Arc::new(InMemoryStorage::new());
        let patient = Uuid::new_v4();
        storage
            .add_patient(
                patient,
                Some(LabValues {
                    egfr: 70.0,
                    uacr: Some(40.0),
                }),
                TreatmentContext::default(),
            )
            .await;

        let mut handles = Vec::new();
        for seed in 0..8u64 {
            let storage = Arc::clone(&storage);
            handles.push(tokio::spawn(async move {
                let mut rng = call_rng(Some(seed), patient, 0);
                get_or_create_profile(storage.as_ref(), patient, &mut rng).await
            }));
        }

        let mut profiles = Vec::new();
        for handle in handles {
            profiles.push(handle.await.unwrap().unwrap());
        }
        assert!(profiles.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(
            storage.get_profile(patient).await.unwrap().as_ref(),
            Some(&profiles[0])
        );
    }
}
