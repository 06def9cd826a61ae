use chrono::Utc;
use uuid::Uuid;

use crate::models::{
    Alert, AlertReason, AlertStatus, ChangeType, Classification, GfrCategory, Priority, Recommendation,
    RecommendationCategory, RecommendationStatus, Severity, Transition, TreatmentContext, Urgency,
};

const UACR_SEVERE_CEILING: f64 = 300.0;

pub fn priority_for(severity: Severity) -> Priority {
    match severity {
        Severity::Critical => Priority::Urgent,
        Severity::Warning => Priority::High,
        Severity::Info => Priority::Medium,
    }
}

/// Builds the alert for a transition whose comparison fired at least one reason.
pub fn build_alert(transition: &Transition, reasons: Vec<AlertReason>) -> Option<Alert> {
    let severity = reasons.iter().map(|reason| reason.severity).max()?;
    let current = &transition.to_classification;
    let previous = &transition.from_classification;

    let title = match severity {
        Severity::Critical => format!("Critical kidney function change: {}", current.health_state),
        Severity::Warning => format!("Kidney health worsening: {}", current.health_state),
        Severity::Info => format!("Kidney health update: {}", current.health_state),
    };
    let message = format!(
        "Cycle {} -> {}: {} ({} risk) to {} ({} risk). eGFR {:.1} -> {:.1}{}.",
        transition.from_cycle,
        transition.to_cycle,
        previous.health_state,
        previous.risk_level,
        current.health_state,
        current.risk_level,
        previous.gfr_value,
        current.gfr_value,
        match (previous.uacr_value, current.uacr_value) {
            (Some(before), Some(after)) => format!(", uACR {before:.1} -> {after:.1} mg/g"),
            (None, Some(after)) => format!(", uACR {after:.1} mg/g"),
            _ => String::new(),
        }
    );

    Some(Alert {
        id: Uuid::new_v4(),
        patient_id: transition.patient_id,
        transition_id: transition.id,
        severity,
        priority: priority_for(severity),
        title,
        message,
        reasons,
        requires_action: severity == Severity::Critical || current.requires_nephrology_referral,
        status: AlertStatus::Active,
        created_at: Utc::now(),
    })
}

struct Draft {
    category: RecommendationCategory,
    priority: Priority,
    urgency: Urgency,
    title: &'static str,
    timeframe: String,
    rationale: String,
}

/// Derives treatment recommendations for the current state. May be empty.
pub fn derive_recommendations(
    patient_id: Uuid,
    alert_id: Option<Uuid>,
    change_type: ChangeType,
    current: &Classification,
    treatment: TreatmentContext,
) -> Vec<Recommendation> {
    let mut drafts = Vec::new();
    let egfr = current.gfr_value;

    if current.requires_nephrology_referral {
        let advanced = current.ckd_stage.is_some_and(|stage| stage >= 4);
        drafts.push(Draft {
            category: RecommendationCategory::Referral,
            priority: if advanced { Priority::Urgent } else { Priority::High },
            urgency: if advanced { Urgency::Urgent } else { Urgency::Soon },
            title: "Refer to nephrology",
            timeframe: if advanced { "within 2 weeks" } else { "within 3 months" }.to_string(),
            rationale: format!(
                "{} with eGFR {:.1}{} meets nephrology referral criteria",
                current.health_state,
                egfr,
                current
                    .uacr_value
                    .map(|uacr| format!(" and uACR {uacr:.1} mg/g"))
                    .unwrap_or_default()
            ),
        });
    }

    if current.uacr_value.is_none() && current.gfr_category != GfrCategory::G1 {
        drafts.push(Draft {
            category: RecommendationCategory::Monitoring,
            priority: Priority::Medium,
            urgency: Urgency::Soon,
            title: "Measure urine albumin-to-creatinine ratio",
            timeframe: "within 1 month".to_string(),
            rationale: format!(
                "eGFR {egfr:.1} ({}) without a recorded uACR; albuminuria staging is incomplete",
                current.gfr_category
            ),
        });
    }

    if current.recommend_ras_inhibitor && !treatment.on_ras_inhibitor {
        let severe = current.uacr_value.is_some_and(|uacr| uacr > UACR_SEVERE_CEILING);
        drafts.push(Draft {
            category: RecommendationCategory::Medication,
            priority: Priority::High,
            urgency: if severe { Urgency::Urgent } else { Urgency::Soon },
            title: "Start ACE inhibitor or ARB",
            timeframe: if severe { "within 2 weeks" } else { "within 1 month" }.to_string(),
            rationale: format!(
                "Albuminuria {} (uACR {}) without RAS inhibition",
                current.albuminuria_category,
                format_uacr(current.uacr_value)
            ),
        });
    }

    if current.recommend_sglt2i && !treatment.on_sglt2i {
        drafts.push(Draft {
            category: RecommendationCategory::Medication,
            priority: Priority::High,
            urgency: Urgency::Soon,
            title: "Start SGLT2 inhibitor",
            timeframe: "within 1 month".to_string(),
            rationale: format!(
                "Albuminuria {} (uACR {}) with eGFR {egfr:.1} >= 20 and no SGLT2 inhibitor",
                current.albuminuria_category,
                format_uacr(current.uacr_value)
            ),
        });
    }

    if change_type == ChangeType::Worsened {
        drafts.push(Draft {
            category: RecommendationCategory::Monitoring,
            priority: Priority::Medium,
            urgency: Urgency::Routine,
            title: "Increase monitoring frequency",
            timeframe: current.monitoring_frequency.clone(),
            rationale: format!(
                "Worsening to {} ({} risk) at eGFR {egfr:.1}",
                current.health_state, current.risk_level
            ),
        });
    }

    if current.requires_dialysis_planning {
        drafts.push(Draft {
            category: RecommendationCategory::DialysisPlanning,
            priority: Priority::Urgent,
            urgency: if current.gfr_category == GfrCategory::G5 {
                Urgency::Urgent
            } else {
                Urgency::Soon
            },
            title: "Begin kidney replacement therapy planning",
            timeframe: if current.gfr_category == GfrCategory::G5 {
                "immediately"
            } else {
                "within 3 months"
            }
            .to_string(),
            rationale: format!(
                "eGFR {egfr:.1} ({}, CKD stage {})",
                current.gfr_category, current.ckd_stage_name
            ),
        });
    }

    let created_at = Utc::now();
    drafts
        .into_iter()
        .map(|draft| Recommendation {
            id: Uuid::new_v4(),
            patient_id,
            alert_id,
            category: draft.category,
            priority: draft.priority,
            urgency: draft.urgency,
            title: draft.title.to_string(),
            timeframe: draft.timeframe,
            rationale: draft.rationale,
            status: RecommendationStatus::Pending,
            created_at,
        })
        .collect()
}

fn format_uacr(uacr: Option<f64>) -> String {
    uacr.map(|value| format!("{value:.1} mg/g"))
        .unwrap_or_else(|| "not measured".to_string())
}
