use crate::error::{EngineError, Result};
use crate::models::{AlbuminuriaCategory, Classification, GfrCategory, RiskLevel};

/// eGFR at or above which SGLT2 inhibitors are still recommended.
const SGLT2I_MIN_EGFR: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CkdStage {
    pub stage: Option<u8>,
    pub name: &'static str,
}

/// Classifies possibly-missing lab values. eGFR is mandatory; a missing uACR
/// means "not measured".
pub fn classify_labs(egfr: Option<f64>, uacr: Option<f64>) -> Result<Classification> {
    let egfr = egfr.ok_or(EngineError::MissingEgfr)?;
    if !egfr.is_finite() {
        return Err(EngineError::InvalidLabValue {
            field: "egfr",
            value: egfr,
        });
    }
    if let Some(value) = uacr.filter(|value| !value.is_finite()) {
        return Err(EngineError::InvalidLabValue {
            field: "uacr",
            value,
        });
    }
    Ok(classify(egfr, uacr))
}

pub fn classify(egfr: f64, uacr: Option<f64>) -> Classification {
    let gfr_category = classify_gfr(egfr);
    let albuminuria_category = classify_albuminuria(uacr);
    let risk_level = risk_level(gfr_category, albuminuria_category);
    let stage = determine_ckd_stage(gfr_category, albuminuria_category);
    let albuminuric = albuminuria_category != AlbuminuriaCategory::A1;

    Classification {
        gfr_category,
        gfr_value: egfr,
        albuminuria_category,
        uacr_value: uacr,
        health_state: health_state(gfr_category, albuminuria_category),
        risk_level,
        risk_color: risk_color(risk_level).to_string(),
        ckd_stage: stage.stage,
        ckd_stage_name: stage.name.to_string(),
        requires_nephrology_referral: matches!(
            gfr_category,
            GfrCategory::G3b | GfrCategory::G4 | GfrCategory::G5
        ) || albuminuria_category == AlbuminuriaCategory::A3
            || risk_level == RiskLevel::VeryHigh,
        requires_dialysis_planning: matches!(gfr_category, GfrCategory::G4 | GfrCategory::G5),
        recommend_ras_inhibitor: albuminuric,
        recommend_sglt2i: albuminuric && egfr >= SGLT2I_MIN_EGFR,
        target_bp: if albuminuric { "<130/80" } else { "<140/90" }.to_string(),
        monitoring_frequency: monitoring_frequency(risk_level).to_string(),
    }
}

pub fn classify_gfr(egfr: f64) -> GfrCategory {
    match egfr {
        v if v >= 90.0 => GfrCategory::G1,
        v if v >= 60.0 => GfrCategory::G2,
        v if v >= 45.0 => GfrCategory::G3a,
        v if v >= 30.0 => GfrCategory::G3b,
        v if v >= 15.0 => GfrCategory::G4,
        _ => GfrCategory::G5,
    }
}

pub fn classify_albuminuria(uacr: Option<f64>) -> AlbuminuriaCategory {
    match uacr {
        None => AlbuminuriaCategory::A1,
        Some(v) if v < 30.0 => AlbuminuriaCategory::A1,
        Some(v) if v <= 300.0 => AlbuminuriaCategory::A2,
        Some(_) => AlbuminuriaCategory::A3,
    }
}

pub fn health_state(gfr: GfrCategory, albuminuria: AlbuminuriaCategory) -> String {
    format!("{gfr}-{albuminuria}")
}

pub fn risk_level(gfr: GfrCategory, albuminuria: AlbuminuriaCategory) -> RiskLevel {
    use AlbuminuriaCategory::*;
    use GfrCategory::*;

    match (gfr, albuminuria) {
        (G1 | G2, A1) => RiskLevel::Low,
        (G1 | G2, A2) => RiskLevel::Moderate,
        (G1 | G2, A3) => RiskLevel::High,
        (G3a, A1) => RiskLevel::Moderate,
        (G3a, A2) => RiskLevel::High,
        (G3a, A3) => RiskLevel::VeryHigh,
        (G3b, A1) => RiskLevel::High,
        (G3b, A2 | A3) => RiskLevel::VeryHigh,
        (G4 | G5, _) => RiskLevel::VeryHigh,
    }
}

pub fn determine_ckd_stage(gfr: GfrCategory, albuminuria: AlbuminuriaCategory) -> CkdStage {
    let albuminuric = albuminuria != AlbuminuriaCategory::A1;
    let (stage, name) = match gfr {
        GfrCategory::G1 if albuminuric => (Some(1), "1"),
        GfrCategory::G2 if albuminuric => (Some(2), "2"),
        GfrCategory::G1 | GfrCategory::G2 => (None, "No CKD"),
        GfrCategory::G3a => (Some(3), "3a"),
        GfrCategory::G3b => (Some(3), "3b"),
        GfrCategory::G4 => (Some(4), "4"),
        GfrCategory::G5 => (Some(5), "5"),
    };
    CkdStage { stage, name }
}

pub fn monitoring_frequency(risk: RiskLevel) -> &'static str {
    match risk {
        RiskLevel::Low => "annual",
        RiskLevel::Moderate => "6–12 months",
        RiskLevel::High => "3–6 months",
        RiskLevel::VeryHigh => "1–3 months",
    }
}

pub fn risk_color(risk: RiskLevel) -> &'static str {
    match risk {
        RiskLevel::Low => "green",
        RiskLevel::Moderate => "yellow",
        RiskLevel::High => "orange",
        RiskLevel::VeryHigh => "red",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AlbuminuriaCategory::*;
    use GfrCategory::*;

    #[test]
    fn gfr_boundaries_are_lower_inclusive() {
        assert_eq!(classify_gfr(120.0), G1);
        assert_eq!(classify_gfr(90.0), G1);
        assert_eq!(classify_gfr(89.99), G2);
        assert_eq!(classify_gfr(60.0), G2);
        assert_eq!(classify_gfr(59.99), G3a);
        assert_eq!(classify_gfr(45.0), G3a);
        assert_eq!(classify_gfr(44.99), G3b);
        assert_eq!(classify_gfr(30.0), G3b);
        assert_eq!(classify_gfr(29.99), G4);
        assert_eq!(classify_gfr(15.0), G4);
        assert_eq!(classify_gfr(14.99), G5);
        assert_eq!(classify_gfr(0.0), G5);
    }

    #[test]
    fn albuminuria_boundaries() {
        assert_eq!(classify_albuminuria(None), A1);
        assert_eq!(classify_albuminuria(Some(29.99)), A1);
        assert_eq!(classify_albuminuria(Some(30.0)), A2);
        assert_eq!(classify_albuminuria(Some(300.0)), A2);
        assert_eq!(classify_albuminuria(Some(300.01)), A3);
    }

    #[test]
    fn risk_matrix_matches_all_eighteen_cells() {
        use RiskLevel::*;
        let expected = [
            (G1, [Low, Moderate, High]),
            (G2, [Low, Moderate, High]),
            (G3a, [Moderate, High, VeryHigh]),
            (G3b, [High, VeryHigh, VeryHigh]),
            (G4, [VeryHigh, VeryHigh, VeryHigh]),
            (G5, [VeryHigh, VeryHigh, VeryHigh]),
        ];

        let mut checked = 0;
        for (gfr, row) in expected {
            for (albuminuria, risk) in [A1, A2, A3].into_iter().zip(row) {
                assert_eq!(risk_level(gfr, albuminuria), risk, "{gfr}-{albuminuria}");
                checked += 1;
            }
        }
        assert_eq!(checked, 18);
    }

    #[test]
    fn ckd_stage_rules() {
        assert_eq!(determine_ckd_stage(G1, A1), CkdStage { stage: None, name: "No CKD" });
        assert_eq!(determine_ckd_stage(G1, A2).stage, Some(1));
        assert_eq!(determine_ckd_stage(G2, A1).stage, None);
        assert_eq!(determine_ckd_stage(G2, A3).stage, Some(2));
        for albuminuria in [A1, A2, A3] {
            assert_eq!(determine_ckd_stage(G3a, albuminuria), CkdStage { stage: Some(3), name: "3a" });
            assert_eq!(determine_ckd_stage(G3b, albuminuria), CkdStage { stage: Some(3), name: "3b" });
        }
        assert_eq!(determine_ckd_stage(G4, A1).stage, Some(4));
        assert_eq!(determine_ckd_stage(G5, A1).stage, Some(5));
    }

    #[test]
    fn classifies_g3a_a2_example() {
        let classification = classify(59.9, Some(31.0));
        assert_eq!(classification.gfr_category, G3a);
        assert_eq!(classification.albuminuria_category, A2);
        assert_eq!(classification.health_state, "G3a-A2");
        assert_eq!(classification.risk_level, RiskLevel::High);
        assert_eq!(classification.ckd_stage, Some(3));
        assert_eq!(classification.monitoring_frequency, "3–6 months");
        assert!(classification.recommend_ras_inhibitor);
        assert!(classification.recommend_sglt2i);
        assert!(!classification.requires_nephrology_referral);
        assert_eq!(classification.target_bp, "<130/80");
    }

    #[test]
    fn treatment_flags_follow_categories() {
        let normal = classify(95.0, None);
        assert_eq!(normal.risk_level, RiskLevel::Low);
        assert_eq!(normal.monitoring_frequency, "annual");
        assert_eq!(normal.target_bp, "<140/90");
        assert!(!normal.recommend_ras_inhibitor);
        assert!(!normal.requires_nephrology_referral);

        let heavy_proteinuria = classify(95.0, Some(450.0));
        assert!(heavy_proteinuria.requires_nephrology_referral);
        assert!(!heavy_proteinuria.requires_dialysis_planning);

        let advanced = classify(22.0, Some(120.0));
        assert!(advanced.requires_dialysis_planning);
        assert!(advanced.requires_nephrology_referral);
        assert!(advanced.recommend_sglt2i);

        let below_sglt2i_floor = classify(19.5, Some(120.0));
        assert!(below_sglt2i_floor.recommend_ras_inhibitor);
        assert!(!below_sglt2i_floor.recommend_sglt2i);

        let g3b_without_albuminuria = classify(40.0, Some(10.0));
        assert!(g3b_without_albuminuria.requires_nephrology_referral);
        assert!(!g3b_without_albuminuria.recommend_sglt2i);
    }

    #[test]
    fn missing_egfr_fails_fast() {
        assert!(matches!(classify_labs(None, Some(12.0)), Err(EngineError::MissingEgfr)));
        assert!(matches!(
            classify_labs(Some(f64::NAN), None),
            Err(EngineError::InvalidLabValue { field: "egfr", .. })
        ));
        let classification = classify_labs(Some(72.0), None).unwrap();
        assert_eq!(classification.albuminuria_category, A1);
        assert_eq!(classification.uacr_value, None);
    }
}
