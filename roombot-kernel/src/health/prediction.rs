//! Tendance des scores par composant (régression linéaire, purement indicative).

use crate::events::HealthEvent;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Prediction {
    pub current: f64,
    pub projected: f64,
    /// Variation de score par cycle
    pub slope: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct PredictionParams {
    pub window: usize,
    pub horizon: u32,
    pub risk_threshold: f64,
}

/// Pente des moindres carrés sur les `window` derniers scores, projetée `horizon` cycles plus loin.
/// `None` tant qu'il y a moins de deux points.
pub fn predict(history: &[f64], window: usize, horizon: u32) -> Option<Prediction> {
    let start = history.len().saturating_sub(window.max(2));
    let points = &history[start..];
    if points.len() < 2 {
        return None;
    }

    let n = points.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = points.iter().sum::<f64>() / n;

    let (mut num, mut den) = (0.0, 0.0);
    for (i, y) in points.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }
    let slope = if den == 0.0 { 0.0 } else { num / den };
    let current = *points.last()?;
    let projected = (current + slope * f64::from(horizon)).clamp(0.0, 1.0);

    Some(Prediction { current, projected, slope })
}

/// Composants dont la trajectoire descend sous le seuil de risque
pub fn at_risk(score_history: &BTreeMap<String, Vec<f64>>, params: PredictionParams) -> Vec<HealthEvent> {
    score_history
        .iter()
        .filter_map(|(id, history)| {
            let p = predict(history, params.window, params.horizon)?;
            (p.slope < 0.0 && p.projected < params.risk_threshold).then(|| HealthEvent::PredictionRisk {
                component: id.clone(),
                current: p.current,
                projected: p.projected,
                slope: p.slope,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_history_has_zero_slope() {
        let p = predict(&[0.9, 0.9, 0.9, 0.9], 10, 5).unwrap();
        assert_eq!(p.slope, 0.0);
        assert_eq!(p.projected, 0.9);
    }

    #[test]
    fn test_single_point_is_not_enough() {
        assert!(predict(&[1.0], 10, 5).is_none());
        assert!(predict(&[], 10, 5).is_none());
    }

    #[test]
    fn test_declining_component_is_flagged() {
        let mut history = BTreeMap::new();
        history.insert("connection".to_string(), vec![1.0, 0.95, 0.9, 0.85, 0.8]);
        history.insert("process".to_string(), vec![1.0, 1.0, 1.0]);

        let params = PredictionParams { window: 10, horizon: 5, risk_threshold: 0.7 };
        let flagged = at_risk(&history, params);
        assert_eq!(flagged.len(), 1);
        match &flagged[0] {
            HealthEvent::PredictionRisk { component, projected, slope, .. } => {
                assert_eq!(component, "connection");
                assert!(*slope < 0.0);
                assert!((projected - 0.55).abs() < 1e-9);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_window_only_uses_recent_points() {
        // chute ancienne, puis plateau
        let p = predict(&[1.0, 0.2, 0.6, 0.6, 0.6], 3, 5).unwrap();
        assert_eq!(p.slope, 0.0);
    }
}
