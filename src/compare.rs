use crate::models::{
    AlertReason, ChangeType, Classification, Comparison, GfrCategory, GfrTrend, Severity,
    UacrTrend,
};

/// eGFR change (units) beyond which the trend is no longer stable.
pub const GFR_TREND_THRESHOLD: f64 = 5.0;
/// uACR change (mg/g) beyond which the trend is no longer stable.
pub const UACR_TREND_THRESHOLD: f64 = 10.0;

const EGFR_SEVERE_FLOOR: f64 = 30.0;
const EGFR_FAILURE_FLOOR: f64 = 15.0;
const UACR_SEVERE_CEILING: f64 = 300.0;

pub fn gfr_trend(change: f64) -> GfrTrend {
    if change > GFR_TREND_THRESHOLD {
        GfrTrend::Improving
    } else if change < -GFR_TREND_THRESHOLD {
        GfrTrend::Declining
    } else {
        GfrTrend::Stable
    }
}

pub fn uacr_trend(change: Option<f64>) -> UacrTrend {
    match change {
        None => UacrTrend::Unknown,
        Some(c) if c < -UACR_TREND_THRESHOLD => UacrTrend::Improving,
        Some(c) if c > UACR_TREND_THRESHOLD => UacrTrend::Worsening,
        Some(_) => UacrTrend::Stable,
    }
}

pub fn compare(previous: &Classification, current: &Classification) -> Comparison {
    let gfr_change = current.gfr_value - previous.gfr_value;
    let gfr_trend = gfr_trend(gfr_change);
    let uacr_change = match (previous.uacr_value, current.uacr_value) {
        (Some(before), Some(after)) => Some(after - before),
        _ => None,
    };
    let uacr_trend = uacr_trend(uacr_change);

    let category_changed = previous.gfr_category != current.gfr_category
        || previous.albuminuria_category != current.albuminuria_category;
    let risk_increased = current.risk_level > previous.risk_level;

    let change_type = if category_changed {
        if risk_increased || gfr_trend == GfrTrend::Declining {
            ChangeType::Worsened
        } else {
            ChangeType::Improved
        }
    } else if gfr_trend == GfrTrend::Declining || uacr_trend == UacrTrend::Worsening {
        ChangeType::Worsened
    } else if gfr_trend == GfrTrend::Improving || uacr_trend == UacrTrend::Improving {
        ChangeType::Improved
    } else {
        ChangeType::Stable
    };

    let has_changed = category_changed
        || gfr_change.abs() > GFR_TREND_THRESHOLD
        || uacr_change.is_some_and(|change| change.abs() > UACR_TREND_THRESHOLD);

    let (reasons, crossed_critical_threshold) =
        alert_reasons(previous, current, gfr_trend, uacr_trend, risk_increased);

    Comparison {
        gfr_change,
        gfr_trend,
        uacr_change,
        uacr_trend,
        category_changed,
        risk_increased,
        crossed_critical_threshold,
        change_type,
        has_changed,
        reasons,
    }
}

/// Collects every alert reason that applies, in a fixed order, along with
/// whether any hard clinical threshold was crossed.
fn alert_reasons(
    previous: &Classification,
    current: &Classification,
    gfr_trend: GfrTrend,
    uacr_trend: UacrTrend,
    risk_increased: bool,
) -> (Vec<AlertReason>, bool) {
    let mut reasons = Vec::new();
    let mut crossed = false;

    if current.gfr_category > previous.gfr_category && gfr_trend == GfrTrend::Declining {
        let severity = if matches!(current.gfr_category, GfrCategory::G4 | GfrCategory::G5) {
            Severity::Critical
        } else {
            Severity::Warning
        };
        reasons.push(AlertReason::new(
            severity,
            format!(
                "eGFR category worsened from {} to {} (eGFR {:.1} -> {:.1})",
                previous.gfr_category, current.gfr_category, previous.gfr_value, current.gfr_value
            ),
        ));
    }

    if current.albuminuria_category > previous.albuminuria_category
        && uacr_trend == UacrTrend::Worsening
    {
        reasons.push(AlertReason::new(
            Severity::Warning,
            format!(
                "Albuminuria category worsened from {} to {}",
                previous.albuminuria_category, current.albuminuria_category
            ),
        ));
    }

    if risk_increased {
        reasons.push(AlertReason::new(
            Severity::Warning,
            format!(
                "Risk level increased from {} to {}",
                previous.risk_level, current.risk_level
            ),
        ));
    }

    if previous.gfr_value >= EGFR_SEVERE_FLOOR && current.gfr_value < EGFR_SEVERE_FLOOR {
        crossed = true;
        reasons.push(AlertReason::new(
            Severity::Critical,
            format!(
                "eGFR fell below {EGFR_SEVERE_FLOOR:.0} ({:.1}): severe reduction in kidney function",
                current.gfr_value
            ),
        ));
    }

    if previous.gfr_value >= EGFR_FAILURE_FLOOR && current.gfr_value < EGFR_FAILURE_FLOOR {
        crossed = true;
        reasons.push(AlertReason::new(
            Severity::Critical,
            format!(
                "eGFR fell below {EGFR_FAILURE_FLOOR:.0} ({:.1}): kidney failure range",
                current.gfr_value
            ),
        ));
    }

    let previously_below_ceiling = previous
        .uacr_value
        .map_or(true, |uacr| uacr <= UACR_SEVERE_CEILING);
    if let Some(uacr) = current.uacr_value {
        if uacr > UACR_SEVERE_CEILING && previously_below_ceiling {
            crossed = true;
            reasons.push(AlertReason::new(
                Severity::Critical,
                format!("uACR rose above {UACR_SEVERE_CEILING:.0} mg/g ({uacr:.1}): severely increased albuminuria"),
            ));
        }
    }

    if current.requires_nephrology_referral && !previous.requires_nephrology_referral {
        reasons.push(AlertReason::new(
            Severity::Warning,
            format!("Nephrology referral now indicated ({})", current.health_state),
        ));
    }

    (reasons, crossed)
}
