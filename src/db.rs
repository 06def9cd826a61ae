use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::models::{
    Alert, AlertReason, Classification, Cycle, CycleInsert, LabValues, ProgressionProfile,
    Recommendation, Transition, TreatmentContext,
};
use crate::store::Storage;

pub async fn init_db(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

type SeedPatient = (Uuid, &'static str, &'static str, bool, bool);
type SeedLab = (&'static str, &'static str, f64, Option<f64>, (i32, u32, u32));

/// Demonstration patients: `(id, name, mrn, on RAS inhibitor, on SGLT2i)`.
const SEED_PATIENTS: [SeedPatient; 3] = [
    (
        Uuid::from_u128(0x6b1e4c2a_8f3d_4a57_9c0e_2d7b5f18a3c4),
        "Marisol Okafor",
        "CKD-20417",
        false,
        false,
    ),
    (
        Uuid::from_u128(0xa49d07e3_15c6_4b82_b3f1_7e60c9d2548b),
        "Tobias Lindqvist",
        "CKD-20588",
        true,
        false,
    ),
    (
        Uuid::from_u128(0xf2c85b91_3a0e_4d6f_8e27_91b4d6a0c735),
        "Hana Whitfield",
        "CKD-20931",
        true,
        true,
    ),
];

const SEED_LABS: [SeedLab; 5] = [
    ("seed-001", "CKD-20417", 92.0, Some(12.0), (2025, 11, 4)),
    ("seed-002", "CKD-20417", 88.5, Some(18.0), (2026, 2, 2)),
    ("seed-003", "CKD-20588", 61.0, Some(45.0), (2026, 1, 30)),
    ("seed-004", "CKD-20931", 38.0, Some(320.0), (2025, 12, 15)),
    ("seed-005", "CKD-20931", 34.5, None, (2026, 1, 28)),
];

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    for (id, name, mrn, on_ras_inhibitor, on_sglt2i) in SEED_PATIENTS {
        upsert_patient(pool, id, name, mrn, on_ras_inhibitor, on_sglt2i).await?;
    }

    for (source_key, mrn, egfr, uacr, (year, month, day)) in SEED_LABS {
        let patient_id: Uuid = sqlx::query("SELECT id FROM ckd_monitoring.patients WHERE mrn = $1")
            .bind(mrn)
            .fetch_one(pool)
            .await?
            .get("id");
        let measured_on = NaiveDate::from_ymd_opt(year, month, day).context("invalid date")?;
        insert_lab(pool, patient_id, egfr, uacr, measured_on, source_key).await?;
    }

    Ok(())
}

pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        full_name: String,
        mrn: String,
        egfr: f64,
        uacr: Option<f64>,
        measured_on: NaiveDate,
        on_ras_inhibitor: Option<bool>,
        on_sglt2i: Option<bool>,
        source_key: Option<String>,
    }

    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut inserted = 0usize;

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        if !row.egfr.is_finite() || row.uacr.is_some_and(|uacr| !uacr.is_finite()) {
            log::warn!("skipping non-finite lab values for {}", row.mrn);
            continue;
        }

        let patient_id = upsert_patient(
            pool,
            Uuid::new_v4(),
            &row.full_name,
            &row.mrn,
            row.on_ras_inhibitor.unwrap_or(false),
            row.on_sglt2i.unwrap_or(false),
        )
        .await?;

        let source_key = row
            .source_key
            .unwrap_or_else(|| format!("import-{}", Uuid::new_v4()));

        if insert_lab(pool, patient_id, row.egfr, row.uacr, row.measured_on, &source_key).await? {
            inserted += 1;
        }
    }

    Ok(inserted)
}

async fn upsert_patient(
    pool: &PgPool,
    id: Uuid,
    full_name: &str,
    mrn: &str,
    on_ras_inhibitor: bool,
    on_sglt2i: bool,
) -> anyhow::Result<Uuid> {
    let patient_id: Uuid = sqlx::query(
        r#"
        INSERT INTO ckd_monitoring.patients (id, full_name, mrn, on_ras_inhibitor, on_sglt2i)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (mrn) DO UPDATE
        SET full_name = EXCLUDED.full_name,
            on_ras_inhibitor = EXCLUDED.on_ras_inhibitor,
            on_sglt2i = EXCLUDED.on_sglt2i
        RETURNING id
        "#,
    )
    .bind(id)
    .bind(full_name)
    .bind(mrn)
    .bind(on_ras_inhibitor)
    .bind(on_sglt2i)
    .fetch_one(pool)
    .await?
    .get("id");
    Ok(patient_id)
}

async fn insert_lab(
    pool: &PgPool,
    patient_id: Uuid,
    egfr: f64,
    uacr: Option<f64>,
    measured_on: NaiveDate,
    source_key: &str,
) -> anyhow::Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO ckd_monitoring.lab_results
        (id, patient_id, egfr, uacr, measured_on, source_key)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (source_key) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(patient_id)
    .bind(egfr)
    .bind(uacr)
    .bind(measured_on)
    .bind(source_key)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Postgres-backed storage. Conditional inserts rely on the primary keys and
/// unique constraints declared in the migrations.
#[derive(Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn profile_from_row(row: &PgRow) -> Result<ProgressionProfile> {
    Ok(ProgressionProfile {
        patient_id: row.try_get("patient_id")?,
        progression_type: row.try_get::<String, _>("progression_type")?.parse()?,
        baseline_egfr: row.try_get("baseline_egfr")?,
        baseline_uacr: row.try_get("baseline_uacr")?,
        egfr_rate: row.try_get("egfr_rate")?,
        uacr_rate: row.try_get("uacr_rate")?,
        created_at: row.try_get("created_at")?,
    })
}

fn cycle_from_row(row: &PgRow) -> Result<Cycle> {
    Ok(Cycle {
        patient_id: row.try_get("patient_id")?,
        cycle_number: row.try_get("cycle_number")?,
        egfr_value: row.try_get("egfr_value")?,
        uacr_value: row.try_get("uacr_value")?,
        classification: row.try_get::<Json<Classification>, _>("classification")?.0,
        measured_at: row.try_get("measured_at")?,
    })
}

fn transition_from_row(row: &PgRow) -> Result<Transition> {
    Ok(Transition {
        id: row.try_get("id")?,
        patient_id: row.try_get("patient_id")?,
        from_cycle: row.try_get("from_cycle")?,
        to_cycle: row.try_get("to_cycle")?,
        from_classification: row.try_get::<Json<Classification>, _>("from_classification")?.0,
        to_classification: row.try_get::<Json<Classification>, _>("to_classification")?.0,
        change_type: row.try_get::<String, _>("change_type")?.parse()?,
        gfr_change: row.try_get("gfr_change")?,
        uacr_change: row.try_get("uacr_change")?,
        category_changed: row.try_get("category_changed")?,
        risk_increased: row.try_get("risk_increased")?,
        crossed_critical_threshold: row.try_get("crossed_critical_threshold")?,
        alert_generated: row.try_get("alert_generated")?,
        alert_severity: row
            .try_get::<Option<String>, _>("alert_severity")?
            .map(|severity| severity.parse())
            .transpose()?,
        detected_at: row.try_get("detected_at")?,
    })
}

fn alert_from_row(row: &PgRow) -> Result<Alert> {
    Ok(Alert {
        id: row.try_get("id")?,
        patient_id: row.try_get("patient_id")?,
        transition_id: row.try_get("transition_id")?,
        severity: row.try_get::<String, _>("severity")?.parse()?,
        priority: row.try_get::<String, _>("priority")?.parse()?,
        title: row.try_get("title")?,
        message: row.try_get("message")?,
        reasons: row.try_get::<Json<Vec<AlertReason>>, _>("reasons")?.0,
        requires_action: row.try_get("requires_action")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        created_at: row.try_get("created_at")?,
    })
}

fn recommendation_from_row(row: &PgRow) -> Result<Recommendation> {
    Ok(Recommendation {
        id: row.try_get("id")?,
        patient_id: row.try_get("patient_id")?,
        alert_id: row.try_get("alert_id")?,
        category: row.try_get::<String, _>("category")?.parse()?,
        priority: row.try_get::<String, _>("priority")?.parse()?,
        urgency: row.try_get::<String, _>("urgency")?.parse()?,
        title: row.try_get("title")?,
        timeframe: row.try_get("timeframe")?,
        rationale: row.try_get("rationale")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        created_at: row.try_get("created_at")?,
    })
}

const CYCLE_COLUMNS: &str =
    "patient_id, cycle_number, egfr_value, uacr_value, classification, measured_at";

#[async_trait]
impl Storage for PgStorage {
    async fn patient_exists(&self, patient_id: Uuid) -> Result<bool> {
        let exists: bool = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM ckd_monitoring.patients WHERE id = $1) AS present",
        )
        .bind(patient_id)
        .fetch_one(&self.pool)
        .await?
        .try_get("present")?;
        Ok(exists)
    }

    async fn list_patient_ids(&self) -> Result<Vec<Uuid>> {
        let rows = sqlx::query("SELECT id FROM ckd_monitoring.patients ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            ids.push(row.try_get("id")?);
        }
        Ok(ids)
    }

    async fn get_latest_lab_values(&self, patient_id: Uuid) -> Result<Option<LabValues>> {
        let row = sqlx::query(
            r#"
            SELECT egfr, uacr
            FROM ckd_monitoring.lab_results
            WHERE patient_id = $1
            ORDER BY measured_on DESC
            LIMIT 1
            "#,
        )
        .bind(patient_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(LabValues {
                egfr: row.try_get("egfr")?,
                uacr: row.try_get("uacr")?,
            })),
            None => Ok(None),
        }
    }

    async fn get_treatment_context(&self, patient_id: Uuid) -> Result<TreatmentContext> {
        let row = sqlx::query(
            "SELECT on_ras_inhibitor, on_sglt2i FROM ckd_monitoring.patients WHERE id = $1",
        )
        .bind(patient_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| EngineError::not_found("patient", patient_id))?;

        Ok(TreatmentContext {
            on_ras_inhibitor: row.try_get("on_ras_inhibitor")?,
            on_sglt2i: row.try_get("on_sglt2i")?,
        })
    }

    async fn get_profile(&self, patient_id: Uuid) -> Result<Option<ProgressionProfile>> {
        sqlx::query("SELECT * FROM ckd_monitoring.progression_profiles WHERE patient_id = $1")
            .bind(patient_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(profile_from_row)
            .transpose()
    }

    async fn create_profile_if_absent(&self, profile: ProgressionProfile) -> Result<ProgressionProfile> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO ckd_monitoring.progression_profiles
            (patient_id, progression_type, baseline_egfr, baseline_uacr, egfr_rate, uacr_rate, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (patient_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(profile.patient_id)
        .bind(profile.progression_type.as_str())
        .bind(profile.baseline_egfr)
        .bind(profile.baseline_uacr)
        .bind(profile.egfr_rate)
        .bind(profile.uacr_rate)
        .bind(profile.created_at)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(row) => profile_from_row(&row),
            None => self
                .get_profile(profile.patient_id)
                .await?
                .ok_or_else(|| EngineError::not_found("progression profile", profile.patient_id)),
        }
    }

    async fn get_cycle(&self, patient_id: Uuid, cycle_number: i32) -> Result<Option<Cycle>> {
        let sql = format!(
            "SELECT {CYCLE_COLUMNS} FROM ckd_monitoring.cycles WHERE patient_id = $1 AND cycle_number = $2"
        );
        sqlx::query(&sql)
            .bind(patient_id)
            .bind(cycle_number)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(cycle_from_row)
            .transpose()
    }

    async fn create_cycle(&self, cycle: Cycle) -> Result<CycleInsert> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO ckd_monitoring.cycles
            (patient_id, cycle_number, egfr_value, uacr_value, classification, measured_at)
            SELECT $1, $2, $3, $4, $5, $6
            WHERE $2 = 0 OR EXISTS (
                SELECT 1 FROM ckd_monitoring.cycles
                WHERE patient_id = $1 AND cycle_number = $2 - 1
            )
            ON CONFLICT (patient_id, cycle_number) DO NOTHING
            "#,
        )
        .bind(cycle.patient_id)
        .bind(cycle.cycle_number)
        .bind(cycle.egfr_value)
        .bind(cycle.uacr_value)
        .bind(Json(&cycle.classification))
        .bind(cycle.measured_at)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() > 0 {
            return Ok(CycleInsert::Created(cycle));
        }
        match self.get_cycle(cycle.patient_id, cycle.cycle_number).await? {
            Some(existing) => Ok(CycleInsert::Existing(existing)),
            None => Err(EngineError::SequenceGap {
                patient_id: cycle.patient_id,
                requested: cycle.cycle_number,
                missing: cycle.cycle_number - 1,
            }),
        }
    }

    async fn list_cycles(&self, patient_id: Uuid) -> Result<Vec<Cycle>> {
        let sql = format!(
            "SELECT {CYCLE_COLUMNS} FROM ckd_monitoring.cycles WHERE patient_id = $1 ORDER BY cycle_number"
        );
        let rows = sqlx::query(&sql)
            .bind(patient_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(cycle_from_row).collect()
    }

    async fn get_transition(&self, patient_id: Uuid, to_cycle: i32) -> Result<Option<Transition>> {
        sqlx::query("SELECT * FROM ckd_monitoring.transitions WHERE patient_id = $1 AND to_cycle = $2")
            .bind(patient_id)
            .bind(to_cycle)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(transition_from_row)
            .transpose()
    }

    async fn create_transition(&self, transition: Transition) -> Result<Transition> {
        sqlx::query(
            r#"
            INSERT INTO ckd_monitoring.transitions
            (id, patient_id, from_cycle, to_cycle, from_classification, to_classification,
             change_type, gfr_change, uacr_change, category_changed, risk_increased,
             crossed_critical_threshold, alert_generated, alert_severity, detected_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (patient_id, to_cycle) DO NOTHING
            "#,
        )
        .bind(transition.id)
        .bind(transition.patient_id)
        .bind(transition.from_cycle)
        .bind(transition.to_cycle)
        .bind(Json(&transition.from_classification))
        .bind(Json(&transition.to_classification))
        .bind(transition.change_type.as_str())
        .bind(transition.gfr_change)
        .bind(transition.uacr_change)
        .bind(transition.category_changed)
        .bind(transition.risk_increased)
        .bind(transition.crossed_critical_threshold)
        .bind(transition.alert_generated)
        .bind(transition.alert_severity.map(|severity| severity.as_str()))
        .bind(transition.detected_at)
        .execute(&self.pool)
        .await?;

        self.get_transition(transition.patient_id, transition.to_cycle)
            .await?
            .ok_or_else(|| {
                EngineError::not_found(
                    "transition",
                    format!("{}/{}", transition.patient_id, transition.to_cycle),
                )
            })
    }

    async fn list_transitions(&self, patient_id: Uuid) -> Result<Vec<Transition>> {
        let rows = sqlx::query(
            "SELECT * FROM ckd_monitoring.transitions WHERE patient_id = $1 ORDER BY to_cycle",
        )
        .bind(patient_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(transition_from_row).collect()
    }

    async fn create_alert(&self, alert: Alert) -> Result<Alert> {
        sqlx::query(
            r#"
            INSERT INTO ckd_monitoring.alerts
            (id, patient_id, transition_id, severity, priority, title, message, reasons,
             requires_action, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(alert.id)
        .bind(alert.patient_id)
        .bind(alert.transition_id)
        .bind(alert.severity.as_str())
        .bind(alert.priority.as_str())
        .bind(&alert.title)
        .bind(&alert.message)
        .bind(Json(&alert.reasons))
        .bind(alert.requires_action)
        .bind(alert.status.as_str())
        .bind(alert.created_at)
        .execute(&self.pool)
        .await?;
        Ok(alert)
    }

    async fn list_alerts(&self, patient_id: Uuid) -> Result<Vec<Alert>> {
        let rows = sqlx::query(
            "SELECT * FROM ckd_monitoring.alerts WHERE patient_id = $1 ORDER BY created_at",
        )
        .bind(patient_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(alert_from_row).collect()
    }

    async fn create_recommendation(&self, recommendation: Recommendation) -> Result<Recommendation> {
        sqlx::query(
            r#"
            INSERT INTO ckd_monitoring.recommendations
            (id, patient_id, alert_id, category, priority, urgency, title, timeframe,
             rationale, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(recommendation.id)
        .bind(recommendation.patient_id)
        .bind(recommendation.alert_id)
        .bind(recommendation.category.as_str())
        .bind(recommendation.priority.as_str())
        .bind(recommendation.urgency.as_str())
        .bind(&recommendation.title)
        .bind(&recommendation.timeframe)
        .bind(&recommendation.rationale)
        .bind(recommendation.status.as_str())
        .bind(recommendation.created_at)
        .execute(&self.pool)
        .await?;
        Ok(recommendation)
    }

    async fn list_recommendations(&self, patient_id: Uuid) -> Result<Vec<Recommendation>> {
        let rows = sqlx::query(
            "SELECT * FROM ckd_monitoring.recommendations WHERE patient_id = $1 ORDER BY created_at",
        )
        .bind(patient_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(recommendation_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn seed_labs_reference_seeded_patients() {
        let mrns: HashSet<&str> = SEED_PATIENTS.iter().map(|(_, _, mrn, _, _)| *mrn).collect();
        let ids: HashSet<Uuid> = SEED_PATIENTS.iter().map(|(id, _, _, _, _)| *id).collect();
        assert_eq!(mrns.len(), SEED_PATIENTS.len());
        assert_eq!(ids.len(), SEED_PATIENTS.len());

        for (source_key, mrn, egfr, _, (year, month, day)) in SEED_LABS {
            assert!(mrns.contains(mrn), "{source_key} refers to unknown {mrn}");
            assert!(egfr.is_finite());
            assert!(NaiveDate::from_ymd_opt(year, month, day).is_some());
        }
    }
}
