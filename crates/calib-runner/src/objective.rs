use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{CalibError, Result};
use crate::layout::SimulationLayout;
use crate::namelist;
use crate::series::TimeSeries;

/// One observed/simulated column pairing and its weight in the combined
/// error. Unweighted pairs share the weight equally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariablePair {
    pub observed: String,
    pub simulated: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectiveScore {
    /// RMSE per pair, in pair order.
    pub per_variable: Vec<f64>,
    pub weighted: f64,
}

/// Inclusive evaluation window on the shared time index.
pub type EvaluationWindow = (NaiveDateTime, NaiveDateTime);

/// Normalizes weights to sum to 1. `None` means equal weights.
pub fn normalize_weights(weights: Option<&[f64]>, count: usize) -> Result<Vec<f64>> {
    let Some(weights) = weights else {
        return Ok(vec![1.0 / count as f64; count]);
    };
    if weights.len() != count {
        return Err(CalibError::CardinalityMismatch(format!(
            "{} weights for {} variables",
            weights.len(),
            count
        )));
    }
    if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return Err(CalibError::InvalidPlan(
            "weights must be finite and non-negative".to_string(),
        ));
    }
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return Err(CalibError::InvalidPlan("weights sum to zero".to_string()));
    }
    Ok(weights.iter().map(|w| w / total).collect())
}

/// Weighted RMSE over the inner join of the two time indices.
///
/// Pairs where either side is not finite are skipped per variable. A
/// variable left with no pairs, or an empty join, is [`CalibError::NoOverlap`].
pub fn evaluate(
    observed: &TimeSeries,
    simulated: &TimeSeries,
    obs_keys: &[String],
    sim_keys: &[String],
    weights: Option<&[f64]>,
    window: Option<EvaluationWindow>,
) -> Result<ObjectiveScore> {
    if obs_keys.len() != sim_keys.len() {
        return Err(CalibError::CardinalityMismatch(format!(
            "{} observed keys for {} simulated keys",
            obs_keys.len(),
            sim_keys.len()
        )));
    }
    if obs_keys.is_empty() {
        return Err(CalibError::InvalidPlan("no variables to compare".to_string()));
    }
    let weights = normalize_weights(weights, obs_keys.len())?;

    let windowed;
    let observed = match window {
        Some((start, end)) => {
            windowed = observed.window(start, end);
            &windowed
        }
        None => observed,
    };

    let sim_rows: HashMap<NaiveDateTime, usize> = simulated
        .index()
        .iter()
        .enumerate()
        .map(|(i, t)| (*t, i))
        .collect();
    let joined: Vec<(usize, usize)> = observed
        .index()
        .iter()
        .enumerate()
        .filter_map(|(i, t)| sim_rows.get(t).map(|&j| (i, j)))
        .collect();
    if joined.is_empty() {
        return Err(CalibError::NoOverlap { variable: None });
    }

    let mut per_variable = Vec::with_capacity(obs_keys.len());
    for (obs_key, sim_key) in obs_keys.iter().zip(sim_keys) {
        let obs = observed
            .column(obs_key)
            .ok_or_else(|| CalibError::MissingColumn(obs_key.clone()))?;
        let sim = simulated
            .column(sim_key)
            .ok_or_else(|| CalibError::MissingColumn(sim_key.clone()))?;
        let (sum, n) = joined
            .iter()
            .map(|&(i, j)| (obs[i], sim[j]))
            .filter(|(o, s)| o.is_finite() && s.is_finite())
            .fold((0.0, 0usize), |(sum, n), (o, s)| (sum + (s - o).powi(2), n + 1));
        if n == 0 {
            return Err(CalibError::NoOverlap {
                variable: Some(obs_key.clone()),
            });
        }
        per_variable.push((sum / n as f64).sqrt());
    }
    let weighted = per_variable.iter().zip(&weights).map(|(e, w)| e * w).sum();
    Ok(ObjectiveScore {
        per_variable,
        weighted,
    })
}

/// One evaluation of the objective, as reported and recorded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectiveSample {
    pub run_id: String,
    pub parameters: Vec<f64>,
    pub per_variable: Vec<(String, f64)>,
    pub weighted: f64,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
}

/// Which metric cells an optimization ledger row carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricColumns {
    pub save_rmse: bool,
    pub save_run_time: bool,
}

impl Default for MetricColumns {
    fn default() -> Self {
        Self {
            save_rmse: true,
            save_run_time: false,
        }
    }
}

impl MetricColumns {
    /// Per-variable columns appear only when there is more than one variable.
    pub fn header(&self, obs_keys: &[String]) -> Vec<String> {
        let mut header = Vec::new();
        if self.save_rmse {
            if obs_keys.len() > 1 {
                header.extend(obs_keys.iter().cloned());
            }
            header.push("rmse".to_string());
        }
        if self.save_run_time {
            header.push("run_time".to_string());
        }
        header
    }

    pub fn cells(&self, sample: &ObjectiveSample) -> Vec<String> {
        let mut cells = Vec::new();
        if self.save_rmse {
            if sample.per_variable.len() > 1 {
                cells.extend(sample.per_variable.iter().map(|(_, e)| e.to_string()));
            }
            cells.push(sample.weighted.to_string());
        }
        if self.save_run_time {
            cells.push(format!("{:.3}", sample.duration.as_secs_f64()));
        }
        cells
    }
}

/// Fails unless every simulated key is listed in the staged output profile's
/// variable list.
pub fn check_declared_outputs(
    output_nml: &Path,
    layout: &SimulationLayout,
    sim_keys: &[String],
) -> Result<()> {
    let raw = namelist::read_field_from_file(
        output_nml,
        &layout.profile_block,
        &layout.profile_vars_field,
    )?;
    let declared = namelist::split_list(&raw);
    for key in sim_keys {
        if !declared.iter().any(|d| d == key) {
            return Err(CalibError::UndeclaredOutputVariable {
                key: key.clone(),
                block: layout.profile_block.clone(),
                field: layout.profile_vars_field.clone(),
            });
        }
    }
    Ok(())
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::parse_timestamp;

    fn ts(s: &str) -> NaiveDateTime {
        parse_timestamp(s, None).expect("timestamp")
    }

    fn keys(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn series(days: &[&str], cols: &[(&str, Vec<f64>)]) -> TimeSeries {
        let mut s = TimeSeries::new(days.iter().map(|d| ts(d)).collect());
        for (name, values) in cols {
            s.insert_column(*name, values.clone()).expect("column");
        }
        s
    }

    #[test]
    fn identical_series_score_zero_with_any_weights() {
        let days = ["2012-01-01", "2012-01-02", "2012-01-03"];
        let obs = series(&days, &[("a", vec![1.0, 2.0, 3.0]), ("b", vec![4.0, 5.0, 6.0])]);
        let sim = series(&days, &[("sa", vec![1.0, 2.0, 3.0]), ("sb", vec![4.0, 5.0, 6.0])]);
        let score = evaluate(&obs, &sim, &keys(&["a", "b"]), &keys(&["sa", "sb"]), Some(&[2.0, 1.0]), None)
            .expect("score");
        assert_eq!(score.weighted, 0.0);
        assert_eq!(score.per_variable, vec![0.0, 0.0]);
    }

    #[test]
    fn disjoint_indices_are_no_overlap() {
        let obs = series(&["2012-01-01"], &[("a", vec![1.0])]);
        let sim = series(&["2013-01-01"], &[("a", vec![1.0])]);
        let err = evaluate(&obs, &sim, &keys(&["a"]), &keys(&["a"]), None, None).expect_err("disjoint");
        assert_eq!(err.code(), "no_overlap");
    }

    #[test]
    fn rmse_uses_joined_finite_pairs_only() {
        let obs = series(
            &["2012-01-01", "2012-01-02", "2012-01-03", "2012-01-04"],
            &[("a", vec![0.0, 0.0, f64::NAN, 0.0])],
        );
        let sim = series(
            &["2012-01-02", "2012-01-03", "2012-01-04", "2012-01-05"],
            &[("a", vec![3.0, 100.0, 4.0, 100.0])],
        );
        let score = evaluate(&obs, &sim, &keys(&["a"]), &keys(&["a"]), None, None).expect("score");
        // joined rows: 01-02 (0,3), 01-03 skipped as NaN, 01-04 (0,4)
        let expected = ((9.0 + 16.0) / 2.0f64).sqrt();
        assert!((score.weighted - expected).abs() < 1e-12);
    }

    #[test]
    fn weights_are_normalized() {
        let days = ["2012-01-01"];
        let obs = series(&days, &[("a", vec![0.0]), ("b", vec![0.0])]);
        let sim = series(&days, &[("a", vec![1.0]), ("b", vec![4.0])]);
        let score = evaluate(&obs, &sim, &keys(&["a", "b"]), &keys(&["a", "b"]), Some(&[3.0, 1.0]), None)
            .expect("score");
        assert!((score.weighted - (0.75 * 1.0 + 0.25 * 4.0)).abs() < 1e-12);
        assert!(normalize_weights(Some(&[0.0, 0.0]), 2).is_err());
        assert!(normalize_weights(Some(&[1.0]), 2).is_err());
    }

    #[test]
    fn window_restricts_comparison() {
        let days = ["2012-01-01", "2012-01-02", "2012-01-03"];
        let obs = series(&days, &[("a", vec![0.0, 0.0, 0.0])]);
        let sim = series(&days, &[("a", vec![5.0, 1.0, 1.0])]);
        let score = evaluate(
            &obs,
            &sim,
            &keys(&["a"]),
            &keys(&["a"]),
            None,
            Some((ts("2012-01-02"), ts("2012-01-03"))),
        )
        .expect("score");
        assert!((score.weighted - 1.0).abs() < 1e-12);
        let err = evaluate(
            &obs,
            &sim,
            &keys(&["a"]),
            &keys(&["a"]),
            None,
            Some((ts("2013-01-01"), ts("2013-02-01"))),
        )
        .expect_err("empty window");
        assert_eq!(err.code(), "no_overlap");
    }

    #[test]
    fn metric_header_matches_cells() {
        let cols = MetricColumns {
            save_rmse: true,
            save_run_time: true,
        };
        let sample = ObjectiveSample {
            run_id: "o_1".to_string(),
            parameters: vec![0.1],
            per_variable: vec![("a".to_string(), 1.0), ("b".to_string(), 2.0)],
            weighted: 1.5,
            duration: Duration::from_millis(1500),
        };
        assert_eq!(cols.header(&keys(&["a", "b"])), keys(&["a", "b", "rmse", "run_time"]));
        assert_eq!(cols.cells(&sample), keys(&["1", "2", "1.5", "1.500"]));
        assert_eq!(MetricColumns::default().header(&keys(&["a"])), keys(&["rmse"]));
    }
}
