use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

/// Declares a fieldless enum that round-trips through the text form used in
/// JSON payloads and database columns.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = EngineError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok($name::$variant),)+
                    other => Err(EngineError::Corrupt(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

text_enum!(
    /// KDIGO filtration category, ordered from best to worst.
    GfrCategory {
        G1 => "G1",
        G2 => "G2",
        G3a => "G3a",
        G3b => "G3b",
        G4 => "G4",
        G5 => "G5",
    }
);

text_enum!(
    /// KDIGO albuminuria category, ordered from best to worst.
    AlbuminuriaCategory {
        A1 => "A1",
        A2 => "A2",
        A3 => "A3",
    }
);

text_enum!(
    RiskLevel {
        Low => "low",
        Moderate => "moderate",
        High => "high",
        VeryHigh => "very_high",
    }
);

text_enum!(
    ProgressionType {
        Rapid => "rapid",
        Progressive => "progressive",
        Stable => "stable",
        Improving => "improving",
    }
);

text_enum!(
    ChangeType {
        Improved => "improved",
        Worsened => "worsened",
        Stable => "stable",
    }
);

text_enum!(
    GfrTrend {
        Improving => "improving",
        Declining => "declining",
        Stable => "stable",
    }
);

text_enum!(
    UacrTrend {
        Improving => "improving",
        Worsening => "worsening",
        Stable => "stable",
        Unknown => "unknown",
    }
);

text_enum!(
    /// Ordered so that `max()` yields the most severe.
    Severity {
        Info => "info",
        Warning => "warning",
        Critical => "critical",
    }
);

text_enum!(
    Priority {
        Low => "low",
        Medium => "medium",
        High => "high",
        Urgent => "urgent",
    }
);

text_enum!(
    Urgency {
        Routine => "routine",
        Soon => "soon",
        Urgent => "urgent",
    }
);

text_enum!(
    AlertStatus {
        Active => "active",
        Acknowledged => "acknowledged",
        Resolved => "resolved",
    }
);

text_enum!(
    RecommendationCategory {
        Referral => "referral",
        Medication => "medication",
        Monitoring => "monitoring",
        DialysisPlanning => "dialysis_planning",
    }
);

text_enum!(
    RecommendationStatus {
        Pending => "pending",
        Approved => "approved",
        Declined => "declined",
    }
);

/// Result of classifying one eGFR/uACR pair. Field names are part of the
/// contract with timeline consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub gfr_category: GfrCategory,
    pub gfr_value: f64,
    pub albuminuria_category: AlbuminuriaCategory,
    pub uacr_value: Option<f64>,
    pub health_state: String,
    pub risk_level: RiskLevel,
    pub risk_color: String,
    pub ckd_stage: Option<u8>,
    pub ckd_stage_name: String,
    pub requires_nephrology_referral: bool,
    pub requires_dialysis_planning: bool,
    #[serde(rename = "recommendRASInhibitor")]
    pub recommend_ras_inhibitor: bool,
    #[serde(rename = "recommendSGLT2i")]
    pub recommend_sglt2i: bool,
    #[serde(rename = "targetBP")]
    pub target_bp: String,
    pub monitoring_frequency: String,
}

/// Hidden per-patient simulation parameters. Never updated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressionProfile {
    pub patient_id: Uuid,
    pub progression_type: ProgressionType,
    pub baseline_egfr: f64,
    pub baseline_uacr: f64,
    /// eGFR units per month.
    pub egfr_rate: f64,
    /// Fractional uACR change per month.
    pub uacr_rate: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cycle {
    pub patient_id: Uuid,
    pub cycle_number: i32,
    pub egfr_value: f64,
    pub uacr_value: f64,
    pub classification: Classification,
    pub measured_at: DateTime<Utc>,
}

/// Outcome of a conditional cycle insert.
#[derive(Debug, Clone)]
pub enum CycleInsert {
    Created(Cycle),
    Existing(Cycle),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertReason {
    pub text: String,
    pub severity: Severity,
}

impl AlertReason {
    pub fn new(severity: Severity, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            severity,
        }
    }
}

/// Everything the comparator derives from two successive classifications.
#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub gfr_change: f64,
    pub gfr_trend: GfrTrend,
    pub uacr_change: Option<f64>,
    pub uacr_trend: UacrTrend,
    pub category_changed: bool,
    pub risk_increased: bool,
    pub crossed_critical_threshold: bool,
    pub change_type: ChangeType,
    pub has_changed: bool,
    pub reasons: Vec<AlertReason>,
}

impl Comparison {
    pub fn needs_alert(&self) -> bool {
        !self.reasons.is_empty()
    }

    pub fn alert_severity(&self) -> Option<Severity> {
        self.reasons.iter().map(|reason| reason.severity).max()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub from_cycle: i32,
    pub to_cycle: i32,
    pub from_classification: Classification,
    pub to_classification: Classification,
    pub change_type: ChangeType,
    pub gfr_change: f64,
    pub uacr_change: Option<f64>,
    pub category_changed: bool,
    pub risk_increased: bool,
    pub crossed_critical_threshold: bool,
    pub alert_generated: bool,
    pub alert_severity: Option<Severity>,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub transition_id: Uuid,
    pub severity: Severity,
    pub priority: Priority,
    pub title: String,
    pub message: String,
    pub reasons: Vec<AlertReason>,
    pub requires_action: bool,
    pub status: AlertStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub alert_id: Option<Uuid>,
    pub category: RecommendationCategory,
    pub priority: Priority,
    pub urgency: Urgency,
    pub title: String,
    pub timeframe: String,
    pub rationale: String,
    pub status: RecommendationStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LabValues {
    pub egfr: f64,
    pub uacr: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreatmentContext {
    pub on_ras_inhibitor: bool,
    pub on_sglt2i: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleResult {
    pub patient_id: Uuid,
    pub cycle_number: i32,
    pub egfr_value: f64,
    pub uacr_value: f64,
    pub classification: Classification,
    pub transition_detected: bool,
    pub transition_details: Option<Transition>,
    /// True when the cycle already existed and was returned unchanged.
    pub replayed: bool,
    /// Secondary writes that failed after the cycle was persisted.
    pub warnings: Vec<String>,
}

impl CycleResult {
    pub fn from_cycle(cycle: Cycle, transition: Option<Transition>, replayed: bool) -> Self {
        Self {
            patient_id: cycle.patient_id,
            cycle_number: cycle.cycle_number,
            egfr_value: cycle.egfr_value,
            uacr_value: cycle.uacr_value,
            classification: cycle.classification,
            transition_detected: transition.is_some(),
            transition_details: transition,
            replayed,
            warnings: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_enums_round_trip_through_their_text_form() {
        for category in [GfrCategory::G1, GfrCategory::G3a, GfrCategory::G3b, GfrCategory::G5] {
            assert_eq!(category.as_str().parse::<GfrCategory>().unwrap(), category);
        }
        assert_eq!("very_high".parse::<RiskLevel>().unwrap(), RiskLevel::VeryHigh);
        assert!("G6".parse::<GfrCategory>().is_err());
    }

    #[test]
    fn severity_orders_critical_highest() {
        assert!(Severity::Critical > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
    }

    #[test]
    fn classification_serializes_with_consumer_field_names() {
        let classification = crate::risk::classify(59.9, Some(31.0));
        let json = serde_json::to_value(&classification).unwrap();
        assert_eq!(json["gfrCategory"], "G3a");
        assert_eq!(json["albuminuriaCategory"], "A2");
        assert_eq!(json["healthState"], "G3a-A2");
        assert_eq!(json["riskLevel"], "high");
        assert_eq!(json["recommendRASInhibitor"], true);
        assert_eq!(json["recommendSGLT2i"], true);
        assert_eq!(json["targetBP"], "<130/80");
    }
}
