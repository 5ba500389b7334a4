//! Two-stage change point detection with discounted autoregression (SDAR).
//!
//! The first stage scores how unlikely each input is given an AR model learnt online,
//! the scores are smoothed with a moving average and fed to a second stage that scores
//! the deviation of the deviation.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use crate::config::ChangeFinderConfig;

/// `ln(sqrt(2π))`
const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_7;

/// One stage of an online change finder, optionally chained to a second one.
#[derive(Clone, Debug)]
pub struct ChangeFinder {
    ar_order: usize,
    smoothing_window: usize,
    forget_factor: f64,
    /// most recent first
    history: VecDeque<f64>,
    mean: f64,
    sigma: f64,
    pdf_base: Vec<f64>,
    ar_coeff: Vec<f64>,
    recent_scores: VecDeque<f64>,
    second_stage: Option<Box<ChangeFinder>>,
}

impl ChangeFinder {
    /// Builds a single stage change finder.
    pub fn new(ar_order: usize, smoothing_window: usize, forget_factor: f64) -> Self {
        Self {
            ar_order,
            smoothing_window,
            forget_factor,
            history: VecDeque::with_capacity(ar_order + 1),
            mean: 0.,
            sigma: 0.,
            pdf_base: vec![0.; ar_order + 1],
            ar_coeff: vec![0.; ar_order + 1],
            recent_scores: VecDeque::with_capacity(smoothing_window + 1),
            second_stage: None,
        }
    }

    /// Builds a first stage chained to a second stage with the same parameters.
    pub fn two_stage(ar_order: usize, smoothing_window: usize, forget_factor: f64) -> Self {
        let mut first = Self::new(ar_order, smoothing_window, forget_factor);
        first.second_stage = Some(Box::new(Self::new(ar_order, smoothing_window, forget_factor)));
        first
    }

    pub fn from_config(config: &ChangeFinderConfig) -> Self {
        Self::two_stage(config.ar_order, config.smoothing_window, config.forget_factor)
    }

    pub fn is_two_stage(&self) -> bool {
        self.second_stage.is_some()
    }

    /// Learns from `x` and returns its anomaly score, the higher the more anomalous.
    pub fn score(&mut self, x: f64) -> f64 {
        let r = self.forget_factor;
        self.history.push_front(x);
        self.mean = (1. - r) * self.mean + r * x;
        let pdf_base_count = self.history.len().min(self.ar_order + 1);
        for i in 0..pdf_base_count {
            self.pdf_base[i] =
                (1. - r) * self.pdf_base[i] + r * (x - self.mean) * (self.history[i] - self.mean);
        }
        self.solve_ar_coeff(pdf_base_count);
        let predicted = self.predict(pdf_base_count);
        if self.history.len() > self.ar_order {
            self.history.pop_back();
        }
        self.sigma = (1. - r) * self.sigma + r * (x - predicted).powi(2);

        let step_score = step_score(x, predicted, self.sigma);
        self.recent_scores.push_back(step_score);
        if self.recent_scores.len() > self.smoothing_window {
            self.recent_scores.pop_front();
        }
        let moving_avg = smooth(&self.recent_scores, self.smoothing_window);
        debug!(
            stage = if self.is_two_stage() { 1 } else { 2 },
            input = x,
            mean = self.mean,
            sigma = self.sigma,
            predicted,
            step_score,
            moving_avg,
            "change finder step"
        );
        match self.second_stage.as_mut() {
            Some(second) => second.score(moving_avg),
            None => moving_avg,
        }
    }

    /// Forward substitution over the discounted autocovariances.
    fn solve_ar_coeff(&mut self, pdf_base_count: usize) {
        for j in 1..pdf_base_count {
            let mut rest = self.pdf_base[j];
            for m in 1..j {
                rest -= self.pdf_base[j - m] * self.ar_coeff[m];
            }
            self.ar_coeff[j] = if self.pdf_base[0] == 0. {
                0.
            } else {
                rest / self.pdf_base[0]
            };
        }
    }

    fn predict(&self, pdf_base_count: usize) -> f64 {
        (1..pdf_base_count).fold(self.mean, |predicted, i| {
            predicted + self.ar_coeff[i] * (self.history[i] - self.mean)
        })
    }
}

/// Negative log likelihood of `x` under a normal law centered on the prediction.
///
/// Computed in log space and floored at `0`: a density above 1 carries no anomaly, so a
/// predictable stream scores `0` however small its variance gets. A null or negative
/// variance scores `0` too.
fn step_score(x: f64, predicted: f64, sigma: f64) -> f64 {
    if sigma <= 0. {
        return 0.;
    }
    let score = 0.5 * (x - predicted).powi(2) / sigma + LN_SQRT_2PI + 0.5 * sigma.abs().ln();
    if score.is_finite() {
        score.max(0.)
    } else {
        0.
    }
}

/// Moving average over the configured window, even when fewer scores are known.
fn smooth(scores: &VecDeque<f64>, smoothing_window: usize) -> f64 {
    if scores.is_empty() {
        return 0.;
    }
    scores.iter().sum::<f64>() / smoothing_window as f64
}

/// Change finders by key, created the first time a key is seen.
#[derive(Clone, Debug, Default)]
pub struct ChangeFinderTable {
    config: ChangeFinderConfig,
    finders: HashMap<String, ChangeFinder>,
}

impl ChangeFinderTable {
    pub fn new(config: ChangeFinderConfig) -> Self {
        Self {
            config,
            finders: HashMap::new(),
        }
    }

    /// Scores `x` with the change finder of `key`.
    pub fn score(&mut self, key: &str, x: f64) -> f64 {
        let config = &self.config;
        self.finders
            .entry(key.to_string())
            .or_insert_with(|| ChangeFinder::from_config(config))
            .score(x)
    }

    pub fn is_anomalous(&self, score: f64) -> bool {
        score > self.config.score_threshold
    }

    pub fn len(&self) -> usize {
        self.finders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.finders.is_empty()
    }
}
