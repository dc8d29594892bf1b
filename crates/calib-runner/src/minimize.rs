//! Derivative-free minimizers. Every objective call is a full simulation,
//! so both strategies count evaluations and stop at the budget.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::debug;

use crate::error::{CalibError, Result};

pub type Bounds = (f64, f64);

#[derive(Debug, Clone, PartialEq)]
pub struct MinimizeOutcome {
    pub x: Vec<f64>,
    pub fx: f64,
    pub evaluations: usize,
    /// False when the evaluation budget ran out first.
    pub converged: bool,
}

pub trait Minimizer {
    fn minimize(
        &self,
        objective: &mut dyn FnMut(&[f64]) -> Result<f64>,
        x0: &[f64],
        bounds: Option<&[Bounds]>,
    ) -> Result<MinimizeOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MinimizerKind {
    #[default]
    NelderMead,
    CompassSearch,
}

impl MinimizerKind {
    pub fn build(self, max_evaluations: usize) -> Box<dyn Minimizer> {
        match self {
            MinimizerKind::NelderMead => Box::new(NelderMead {
                max_evaluations,
                ..NelderMead::default()
            }),
            MinimizerKind::CompassSearch => Box::new(CompassSearch {
                max_evaluations,
                ..CompassSearch::default()
            }),
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().replace('-', "_").as_str() {
            "nelder_mead" => Some(MinimizerKind::NelderMead),
            "compass_search" | "compass" => Some(MinimizerKind::CompassSearch),
            _ => None,
        }
    }
}

/// Budget and bounds shared by both strategies. Non-finite objective values
/// rank as +inf.
struct Evaluator<'a, 'b> {
    objective: &'a mut dyn FnMut(&[f64]) -> Result<f64>,
    bounds: Option<&'b [Bounds]>,
    max: usize,
    used: usize,
    best: Option<(Vec<f64>, f64)>,
}

impl<'a, 'b> Evaluator<'a, 'b> {
    fn new(
        objective: &'a mut dyn FnMut(&[f64]) -> Result<f64>,
        x0: &[f64],
        bounds: Option<&'b [Bounds]>,
        max: usize,
    ) -> Result<Self> {
        if x0.is_empty() {
            return Err(CalibError::InvalidPlan("nothing to optimize".to_string()));
        }
        if let Some(b) = bounds {
            if b.len() != x0.len() {
                return Err(CalibError::CardinalityMismatch(format!(
                    "{} bounds for {} parameters",
                    b.len(),
                    x0.len()
                )));
            }
            if b.iter().any(|(lo, hi)| !(lo <= hi)) {
                return Err(CalibError::InvalidPlan(
                    "lower bound above upper bound".to_string(),
                ));
            }
        }
        if max == 0 {
            return Err(CalibError::InvalidPlan(
                "max_evaluations must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            objective,
            bounds,
            max,
            used: 0,
            best: None,
        })
    }

    fn clamp(&self, x: &mut [f64]) {
        if let Some(bounds) = self.bounds {
            for (v, (lo, hi)) in x.iter_mut().zip(bounds) {
                *v = v.clamp(*lo, *hi);
            }
        }
    }

    fn exhausted(&self) -> bool {
        self.used >= self.max
    }

    /// `Ok(None)` once the budget is spent.
    fn eval(&mut self, x: &[f64]) -> Result<Option<f64>> {
        if self.exhausted() {
            return Ok(None);
        }
        self.used += 1;
        let raw = (self.objective)(x)?;
        let fx = if raw.is_finite() { raw } else { f64::INFINITY };
        debug!(evaluation = self.used, fx, "objective evaluated");
        let improves = self.best.as_ref().map_or(true, |(_, best)| fx < *best);
        if improves {
            self.best = Some((x.to_vec(), fx));
        }
        Ok(Some(fx))
    }

    fn outcome(self, converged: bool) -> Result<MinimizeOutcome> {
        let (x, fx) = self
            .best
            .ok_or_else(|| CalibError::InvalidPlan("no evaluations were made".to_string()))?;
        Ok(MinimizeOutcome {
            x,
            fx,
            evaluations: self.used,
            converged,
        })
    }
}

fn cmp_f(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

/// Nelder-Mead simplex with the standard coefficients. The initial simplex
/// perturbs each coordinate by 5%, or by 0.00025 when it is zero.
#[derive(Debug, Clone, PartialEq)]
pub struct NelderMead {
    pub max_evaluations: usize,
    /// Convergence tolerance on the simplex diameter.
    pub xatol: f64,
    /// Convergence tolerance on the spread of objective values.
    pub fatol: f64,
}

impl Default for NelderMead {
    fn default() -> Self {
        Self {
            max_evaluations: 100,
            xatol: 1e-4,
            fatol: 1e-4,
        }
    }
}

const REFLECT: f64 = 1.0;
const EXPAND: f64 = 2.0;
const CONTRACT: f64 = 0.5;
const SHRINK: f64 = 0.5;

fn affine(a: &[f64], b: &[f64], t: f64) -> Vec<f64> {
    // a + t * (b - a)
    a.iter().zip(b).map(|(x, y)| x + t * (y - x)).collect()
}

impl Minimizer for NelderMead {
    fn minimize(
        &self,
        objective: &mut dyn FnMut(&[f64]) -> Result<f64>,
        x0: &[f64],
        bounds: Option<&[Bounds]>,
    ) -> Result<MinimizeOutcome> {
        let mut ev = Evaluator::new(objective, x0, bounds, self.max_evaluations)?;
        let n = x0.len();

        let mut start = x0.to_vec();
        ev.clamp(&mut start);
        let mut simplex: Vec<(Vec<f64>, f64)> = Vec::with_capacity(n + 1);
        let Some(f0) = ev.eval(&start)? else {
            return ev.outcome(false);
        };
        simplex.push((start.clone(), f0));
        for i in 0..n {
            let mut vertex = start.clone();
            vertex[i] = if vertex[i] != 0.0 {
                vertex[i] * 1.05
            } else {
                0.00025
            };
            ev.clamp(&mut vertex);
            if vertex[i] == start[i] {
                vertex[i] = if start[i] != 0.0 { start[i] * 0.95 } else { -0.00025 };
                ev.clamp(&mut vertex);
            }
            let Some(fv) = ev.eval(&vertex)? else {
                return ev.outcome(false);
            };
            simplex.push((vertex, fv));
        }

        loop {
            simplex.sort_by(|a, b| cmp_f(a.1, b.1));
            let best_f = simplex[0].1;
            let worst_f = simplex[n].1;
            let spread_f = simplex.iter().map(|(_, f)| (f - best_f).abs()).fold(0.0, f64::max);
            let spread_x = simplex
                .iter()
                .flat_map(|(x, _)| x.iter().zip(&simplex[0].0).map(|(a, b)| (a - b).abs()))
                .fold(0.0, f64::max);
            if spread_f <= self.fatol && spread_x <= self.xatol {
                return ev.outcome(true);
            }
            if ev.exhausted() {
                return ev.outcome(false);
            }

            let mut centroid = vec![0.0; n];
            for (x, _) in &simplex[..n] {
                for (c, v) in centroid.iter_mut().zip(x) {
                    *c += v / n as f64;
                }
            }
            let worst = simplex[n].0.clone();

            let mut reflected = affine(&centroid, &worst, -REFLECT);
            ev.clamp(&mut reflected);
            let Some(fr) = ev.eval(&reflected)? else {
                return ev.outcome(false);
            };

            if fr < best_f {
                let mut expanded = affine(&centroid, &reflected, EXPAND);
                ev.clamp(&mut expanded);
                let Some(fe) = ev.eval(&expanded)? else {
                    simplex[n] = (reflected, fr);
                    return ev.outcome(false);
                };
                simplex[n] = if fe < fr { (expanded, fe) } else { (reflected, fr) };
                continue;
            }
            if fr < simplex[n - 1].1 {
                simplex[n] = (reflected, fr);
                continue;
            }

            let (mut contracted, accept_below) = if fr < worst_f {
                (affine(&centroid, &reflected, CONTRACT), fr)
            } else {
                (affine(&centroid, &worst, CONTRACT), worst_f)
            };
            ev.clamp(&mut contracted);
            let Some(fc) = ev.eval(&contracted)? else {
                return ev.outcome(false);
            };
            if fc <= accept_below {
                simplex[n] = (contracted, fc);
                continue;
            }

            let anchor = simplex[0].0.clone();
            for vertex in simplex.iter_mut().skip(1) {
                let mut shrunk = affine(&anchor, &vertex.0, SHRINK);
                ev.clamp(&mut shrunk);
                let Some(fs) = ev.eval(&shrunk)? else {
                    return ev.outcome(false);
                };
                *vertex = (shrunk, fs);
            }
        }
    }
}

/// Coordinate pattern search: tries +/- step along each axis, halving the
/// steps after a sweep with no improvement.
#[derive(Debug, Clone, PartialEq)]
pub struct CompassSearch {
    pub max_evaluations: usize,
    /// Initial step as a fraction of each coordinate (absolute when zero).
    pub initial_step: f64,
    pub min_step: f64,
}

impl Default for CompassSearch {
    fn default() -> Self {
        Self {
            max_evaluations: 100,
            initial_step: 0.1,
            min_step: 1e-6,
        }
    }
}

impl Minimizer for CompassSearch {
    fn minimize(
        &self,
        objective: &mut dyn FnMut(&[f64]) -> Result<f64>,
        x0: &[f64],
        bounds: Option<&[Bounds]>,
    ) -> Result<MinimizeOutcome> {
        let mut ev = Evaluator::new(objective, x0, bounds, self.max_evaluations)?;
        let mut x = x0.to_vec();
        ev.clamp(&mut x);
        let Some(mut fx) = ev.eval(&x)? else {
            return ev.outcome(false);
        };
        let mut steps: Vec<f64> = x
            .iter()
            .map(|v| {
                if *v != 0.0 {
                    v.abs() * self.initial_step
                } else {
                    self.initial_step
                }
            })
            .collect();

        loop {
            if steps.iter().all(|s| *s < self.min_step) {
                return ev.outcome(true);
            }
            let mut improved = false;
            'axes: for i in 0..x.len() {
                for sign in [1.0, -1.0] {
                    let mut candidate = x.clone();
                    candidate[i] += sign * steps[i];
                    ev.clamp(&mut candidate);
                    if candidate[i] == x[i] {
                        continue;
                    }
                    let Some(fc) = ev.eval(&candidate)? else {
                        return ev.outcome(false);
                    };
                    if fc < fx {
                        x = candidate;
                        fx = fc;
                        improved = true;
                        break 'axes;
                    }
                }
            }
            if !improved {
                for s in steps.iter_mut() {
                    *s *= 0.5;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bowl(x: &[f64]) -> f64 {
        (x[0] - 1.0).powi(2) + 2.0 * (x[1] + 2.0).powi(2)
    }

    #[test]
    fn nelder_mead_finds_quadratic_minimum() {
        let nm = NelderMead {
            max_evaluations: 1000,
            xatol: 1e-6,
            fatol: 1e-10,
        };
        let out = nm
            .minimize(&mut |x| Ok(bowl(x)), &[0.5, 0.5], None)
            .expect("minimize");
        assert!(out.converged);
        assert!((out.x[0] - 1.0).abs() < 1e-3, "{:?}", out.x);
        assert!((out.x[1] + 2.0).abs() < 1e-3, "{:?}", out.x);
    }

    #[test]
    fn compass_search_finds_quadratic_minimum() {
        let cs = CompassSearch {
            max_evaluations: 2000,
            ..CompassSearch::default()
        };
        let out = cs
            .minimize(&mut |x| Ok(bowl(x)), &[0.5, 0.5], None)
            .expect("minimize");
        assert!((out.x[0] - 1.0).abs() < 1e-3, "{:?}", out.x);
        assert!((out.x[1] + 2.0).abs() < 1e-3, "{:?}", out.x);
    }

    #[test]
    fn budget_is_never_exceeded() {
        for kind in [MinimizerKind::NelderMead, MinimizerKind::CompassSearch] {
            let mut calls = 0;
            let out = kind
                .build(7)
                .minimize(
                    &mut |x| {
                        calls += 1;
                        Ok(bowl(x))
                    },
                    &[10.0, 10.0],
                    None,
                )
                .expect("minimize");
            assert_eq!(calls, 7);
            assert_eq!(out.evaluations, 7);
            assert!(!out.converged);
        }
    }

    #[test]
    fn bounds_are_respected() {
        let bounds = [(0.0, 0.5), (-1.0, 1.0)];
        for kind in [MinimizerKind::NelderMead, MinimizerKind::CompassSearch] {
            let mut seen = Vec::new();
            let out = kind
                .build(300)
                .minimize(
                    &mut |x| {
                        seen.push(x.to_vec());
                        Ok(bowl(x))
                    },
                    &[0.25, 0.0],
                    Some(&bounds),
                )
                .expect("minimize");
            assert!(seen
                .iter()
                .all(|x| (0.0..=0.5).contains(&x[0]) && (-1.0..=1.0).contains(&x[1])));
            assert!(out.fx < bowl(&[0.25, 0.0]));
        }
        let out = CompassSearch {
            max_evaluations: 300,
            ..CompassSearch::default()
        }
        .minimize(&mut |x| Ok(bowl(x)), &[0.25, 0.0], Some(&bounds))
        .expect("compass");
        assert!((out.x[0] - 0.5).abs() < 1e-9, "{:?}", out.x);
        assert!((out.x[1] + 1.0).abs() < 1e-9, "{:?}", out.x);
    }

    #[test]
    fn objective_errors_propagate() {
        let err = NelderMead::default()
            .minimize(
                &mut |_| Err(CalibError::InvalidPlan("boom".to_string())),
                &[1.0],
                None,
            )
            .expect_err("error");
        assert_eq!(err.code(), "invalid_plan");
    }

    #[test]
    fn minimizer_names_parse() {
        assert_eq!(MinimizerKind::parse("nelder-mead"), Some(MinimizerKind::NelderMead));
        assert_eq!(MinimizerKind::parse("compass"), Some(MinimizerKind::CompassSearch));
        assert_eq!(MinimizerKind::parse("lbfgs"), None);
    }
}
