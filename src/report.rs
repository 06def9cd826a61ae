use std::fmt::Write;

use uuid::Uuid;

use crate::models::{Alert, Cycle, Recommendation, Transition};

pub fn build_report(
    patient_id: Uuid,
    cycles: &[Cycle],
    transitions: &[Transition],
    alerts: &[Alert],
    recommendations: &[Recommendation],
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# CKD Progression Report");
    let _ = writeln!(output, "Patient {patient_id}");
    if let (Some(first), Some(last)) = (cycles.first(), cycles.last()) {
        let _ = writeln!(
            output,
            "Cycles {} to {}: {} -> {} (eGFR {:.1} -> {:.1})",
            first.cycle_number,
            last.cycle_number,
            first.classification.health_state,
            last.classification.health_state,
            first.egfr_value,
            last.egfr_value
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Timeline");

    if cycles.is_empty() {
        let _ = writeln!(output, "No cycles recorded for this patient.");
    } else {
        let _ = writeln!(output, "| Cycle | Date | eGFR | uACR | State | Risk | Stage |");
        let _ = writeln!(output, "|---|---|---|---|---|---|---|");
        for cycle in cycles {
            let classification = &cycle.classification;
            let _ = writeln!(
                output,
                "| {} | {} | {:.1} | {:.1} | {} | {} | {} |",
                cycle.cycle_number,
                cycle.measured_at.date_naive(),
                cycle.egfr_value,
                cycle.uacr_value,
                classification.health_state,
                classification.risk_level,
                classification.ckd_stage_name
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Transitions");

    if transitions.is_empty() {
        let _ = writeln!(output, "No state transitions detected.");
    } else {
        for transition in transitions {
            let _ = writeln!(
                output,
                "- Cycle {} -> {}: {} ({} -> {}, eGFR change {:+.1}){}",
                transition.from_cycle,
                transition.to_cycle,
                transition.change_type,
                transition.from_classification.health_state,
                transition.to_classification.health_state,
                transition.gfr_change,
                transition
                    .alert_severity
                    .map(|severity| format!(" [{severity} alert]"))
                    .unwrap_or_default()
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Alerts");

    if alerts.is_empty() {
        let _ = writeln!(output, "No alerts raised.");
    } else {
        let mut sorted = alerts.to_vec();
        sorted.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.created_at.cmp(&b.created_at)));
        for alert in sorted {
            let _ = writeln!(output, "- **{}** ({}): {}", alert.title, alert.severity, alert.message);
            for reason in &alert.reasons {
                let _ = writeln!(output, "  - [{}] {}", reason.severity, reason.text);
            }
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Recommendations");

    if recommendations.is_empty() {
        let _ = writeln!(output, "No recommendations pending.");
    } else {
        for recommendation in recommendations {
            let _ = writeln!(
                output,
                "- {} ({}, {} priority, {}): {}",
                recommendation.title,
                recommendation.category,
                recommendation.priority,
                recommendation.timeframe,
                recommendation.rationale
            );
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::models::{AlertReason, AlertStatus, ChangeType, Priority, Severity};
    use crate::risk::classify;

    fn cycle(number: i32, egfr: f64) -> Cycle {
        Cycle {
            patient_id: Uuid::nil(),
            cycle_number: number,
            egfr_value: egfr,
            uacr_value: 10.0,
            classification: classify(egfr, Some(10.0)),
            measured_at: Utc::now(),
        }
    }

    #[test]
    fn empty_report_has_placeholders() {
        let report = build_report(Uuid::nil(), &[], &[], &[], &[]);
        assert!(report.contains("No cycles recorded"));
        assert!(report.contains("No state transitions detected."));
        assert!(report.contains("No alerts raised."));
    }

    #[test]
    fn report_lists_timeline_and_alerts() {
        let cycles = vec![cycle(0, 62.0), cycle(1, 58.0)];
        let transition = Transition {
            id: Uuid::new_v4(),
            patient_id: Uuid::nil(),
            from_cycle: 0,
            to_cycle: 1,
            from_classification: cycles[0].classification.clone(),
            to_classification: cycles[1].classification.clone(),
            change_type: ChangeType::Worsened,
            gfr_change: -4.0,
            uacr_change: Some(0.0),
            category_changed: true,
            risk_increased: true,
            crossed_critical_threshold: false,
            alert_generated: true,
            alert_severity: Some(Severity::Warning),
            detected_at: Utc::now(),
        };
        let alert = Alert {
            id: Uuid::new_v4(),
            patient_id: Uuid::nil(),
            transition_id: transition.id,
            severity: Severity::Warning,
            priority: Priority::High,
            title: "Kidney health worsening: G3a-A1".to_string(),
            message: "Cycle 0 -> 1".to_string(),
            reasons: vec![AlertReason::new(Severity::Warning, "Risk level increased from low to moderate")],
            requires_action: false,
            status: AlertStatus::Active,
            created_at: Utc::now(),
        };

        let report = build_report(Uuid::nil(), &cycles, &[transition], &[alert], &[]);
        assert!(report.contains("Cycles 0 to 1: G2-A1 -> G3a-A1"));
        assert!(report.contains("| 1 |"));
        assert!(report.contains("worsened (G2-A1 -> G3a-A1, eGFR change -4.0) [warning alert]"));
        assert!(report.contains("  - [warning] Risk level increased from low to moderate"));
    }
}
