// =============================================================================
// Hidden Markov Model regime overlay — Viterbi decode + Baum-Welch training
// =============================================================================
//
// Four hidden states (one per regime) over 45 discrete observations encoding
// returnBucket (5) x volBucket (3) x volumeBucket (3). The transition matrix
// is hand-seeded with persistence priors (diagonal ~0.70); emissions are
// seeded with per-regime affinities and can be refined from history with
// Baum-Welch. Trained matrices live in memory only.
//
// The decoded regime is the last backtraced state; confidence is the fraction
// of the last five states equal to it, remapped linearly onto [30, 95].
// =============================================================================

use tracing::{debug, info};

use crate::market_data::Candle;
use crate::regime::detector::Regime;

pub const NUM_STATES: usize = 4;
pub const NUM_OBSERVATIONS: usize = 45;

/// Transition persistence prior: probability of staying in the same state.
const PERSISTENCE: f64 = 0.70;

/// Probability floor applied after every Baum-Welch update so no cell ever
/// collapses to exactly zero.
const PROB_FLOOR: f64 = 1e-6;

/// Minimum observations needed for a meaningful decode.
const MIN_DECODE_OBS: usize = 10;

/// Minimum candles required by the Baum-Welch trainer.
pub const MIN_TRAIN_CANDLES: usize = 100;

/// Rolling window used for the volume bucket.
const VOLUME_WINDOW: usize = 20;

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HmmModel {
    /// transition[from][to]
    transition: [[f64; NUM_STATES]; NUM_STATES],
    /// emission[state][observation]
    emission: [[f64; NUM_OBSERVATIONS]; NUM_STATES],
    initial: [f64; NUM_STATES],
}

/// Hidden-state index to regime mapping.
fn state_regime(state: usize) -> Regime {
    match state {
        0 => Regime::BullTrend,
        1 => Regime::BearTrend,
        2 => Regime::Sideways,
        _ => Regime::HighVolatility,
    }
}

impl HmmModel {
    /// Build the hand-seeded model.
    pub fn seeded() -> Self {
        let off = (1.0 - PERSISTENCE) / (NUM_STATES as f64 - 1.0);
        let mut transition = [[off; NUM_STATES]; NUM_STATES];
        for (i, row) in transition.iter_mut().enumerate() {
            row[i] = PERSISTENCE;
        }

        // Per-state affinities for each observation component.
        // Rows: Bull, Bear, Sideways, HighVol.
        let ret_w: [[f64; 5]; NUM_STATES] = [
            [0.5, 0.8, 1.0, 2.0, 1.6],
            [1.6, 2.0, 1.0, 0.8, 0.5],
            [0.3, 1.0, 2.5, 1.0, 0.3],
            [2.0, 0.8, 0.4, 0.8, 2.0],
        ];
        let vol_w: [[f64; 3]; NUM_STATES] = [
            [1.0, 1.0, 0.6],
            [1.0, 1.0, 0.8],
            [1.6, 1.0, 0.3],
            [0.3, 0.8, 2.2],
        ];
        let volume_w: [[f64; 3]; NUM_STATES] = [
            [0.8, 1.0, 1.4],
            [0.8, 1.0, 1.4],
            [1.2, 1.0, 0.6],
            [0.6, 1.0, 1.8],
        ];

        let mut emission = [[0.0; NUM_OBSERVATIONS]; NUM_STATES];
        for s in 0..NUM_STATES {
            let mut sum = 0.0;
            for r in 0..5 {
                for v in 0..3 {
                    for u in 0..3 {
                        let o = r * 9 + v * 3 + u;
                        let w = ret_w[s][r] * vol_w[s][v] * volume_w[s][u];
                        emission[s][o] = w;
                        sum += w;
                    }
                }
            }
            for o in 0..NUM_OBSERVATIONS {
                emission[s][o] /= sum;
            }
        }

        Self {
            transition,
            emission,
            initial: [1.0 / NUM_STATES as f64; NUM_STATES],
        }
    }

    // -------------------------------------------------------------------------
    // Observation encoding
    // -------------------------------------------------------------------------

    /// Encode candles into the discrete observation alphabet. One observation
    /// per bar starting once the volume window is filled.
    pub fn encode_observations(candles: &[Candle]) -> Vec<usize> {
        if candles.len() <= VOLUME_WINDOW {
            return Vec::new();
        }

        let mut obs = Vec::with_capacity(candles.len() - VOLUME_WINDOW);
        for i in VOLUME_WINDOW..candles.len() {
            let prev_close = candles[i - 1].close;
            if prev_close <= 0.0 {
                continue;
            }
            let ret_pct = (candles[i].close - prev_close) / prev_close * 100.0;
            let range_pct = if candles[i].close > 0.0 {
                (candles[i].high - candles[i].low) / candles[i].close * 100.0
            } else {
                0.0
            };
            let avg_volume = candles[i - VOLUME_WINDOW..i]
                .iter()
                .map(|c| c.volume)
                .sum::<f64>()
                / VOLUME_WINDOW as f64;
            let volume_ratio = if avg_volume > 0.0 {
                candles[i].volume / avg_volume
            } else {
                1.0
            };

            let r = ret_bucket(ret_pct);
            let v = vol_bucket(range_pct);
            let u = volume_bucket(volume_ratio);
            obs.push(r * 9 + v * 3 + u);
        }
        obs
    }

    // -------------------------------------------------------------------------
    // Viterbi decode
    // -------------------------------------------------------------------------

    /// Most likely hidden-state path for an observation sequence (log-space).
    pub fn viterbi(&self, observations: &[usize]) -> Vec<usize> {
        if observations.is_empty() {
            return Vec::new();
        }

        let t_len = observations.len();
        let mut delta = vec![[f64::NEG_INFINITY; NUM_STATES]; t_len];
        let mut psi = vec![[0usize; NUM_STATES]; t_len];

        for s in 0..NUM_STATES {
            delta[0][s] = ln(self.initial[s]) + ln(self.emission[s][observations[0]]);
        }

        for t in 1..t_len {
            for s in 0..NUM_STATES {
                let mut best = f64::NEG_INFINITY;
                let mut best_prev = 0;
                for p in 0..NUM_STATES {
                    let score = delta[t - 1][p] + ln(self.transition[p][s]);
                    if score > best {
                        best = score;
                        best_prev = p;
                    }
                }
                delta[t][s] = best + ln(self.emission[s][observations[t]]);
                psi[t][s] = best_prev;
            }
        }

        // Backtrace from the best final state.
        let mut last = 0;
        for s in 1..NUM_STATES {
            if delta[t_len - 1][s] > delta[t_len - 1][last] {
                last = s;
            }
        }

        let mut path = vec![0usize; t_len];
        path[t_len - 1] = last;
        for t in (1..t_len).rev() {
            path[t - 1] = psi[t][path[t]];
        }
        path
    }

    /// Decode candles into (regime, confidence).
    ///
    /// Confidence is the fraction of the last five decoded states equal to
    /// the final state, remapped linearly onto [30, 95]. Returns `None` when
    /// the encoded sequence is too short.
    pub fn decode_regime(&self, candles: &[Candle]) -> Option<(Regime, f64)> {
        let obs = Self::encode_observations(candles);
        if obs.len() < MIN_DECODE_OBS {
            return None;
        }

        let path = self.viterbi(&obs);
        let last = *path.last()?;

        let tail_len = path.len().min(5);
        let tail = &path[path.len() - tail_len..];
        let agree = tail.iter().filter(|&&s| s == last).count() as f64 / tail_len as f64;
        let confidence = 30.0 + agree * 65.0;

        debug!(
            state = last,
            regime = %state_regime(last),
            confidence = format!("{:.1}", confidence),
            obs = obs.len(),
            "hmm decode"
        );

        Some((state_regime(last), confidence))
    }

    // -------------------------------------------------------------------------
    // Baum-Welch training
    // -------------------------------------------------------------------------

    /// Refine transition/emission matrices from at least
    /// [`MIN_TRAIN_CANDLES`] candles. Returns the final per-observation
    /// log-likelihood, or `None` when the series is too short.
    pub fn train(&mut self, candles: &[Candle], max_iterations: usize) -> Option<f64> {
        if candles.len() < MIN_TRAIN_CANDLES {
            return None;
        }
        let obs = Self::encode_observations(candles);
        if obs.len() < MIN_DECODE_OBS {
            return None;
        }

        let mut last_ll = f64::NEG_INFINITY;
        for iteration in 0..max_iterations {
            let ll = self.baum_welch_step(&obs);
            if !ll.is_finite() {
                break;
            }
            if (ll - last_ll).abs() < 1e-4 {
                last_ll = ll;
                break;
            }
            last_ll = ll;
            debug!(iteration, log_likelihood = format!("{:.4}", ll), "baum-welch step");
        }

        info!(
            observations = obs.len(),
            log_likelihood = format!("{:.4}", last_ll),
            "hmm training complete"
        );
        Some(last_ll)
    }

    /// One scaled forward-backward pass with re-estimation. Returns the total
    /// log-likelihood of the sequence under the pre-update model.
    fn baum_welch_step(&mut self, obs: &[usize]) -> f64 {
        let t_len = obs.len();

        // Forward pass with per-step scaling.
        let mut alpha = vec![[0.0f64; NUM_STATES]; t_len];
        let mut scale = vec![0.0f64; t_len];

        for s in 0..NUM_STATES {
            alpha[0][s] = self.initial[s] * self.emission[s][obs[0]];
        }
        scale[0] = normalize_step(&mut alpha[0]);

        for t in 1..t_len {
            for s in 0..NUM_STATES {
                let mut sum = 0.0;
                for p in 0..NUM_STATES {
                    sum += alpha[t - 1][p] * self.transition[p][s];
                }
                alpha[t][s] = sum * self.emission[s][obs[t]];
            }
            scale[t] = normalize_step(&mut alpha[t]);
        }

        let log_likelihood: f64 = scale.iter().map(|&c| ln(c)).sum();

        // Backward pass with the same scaling factors.
        let mut beta = vec![[0.0f64; NUM_STATES]; t_len];
        for s in 0..NUM_STATES {
            beta[t_len - 1][s] = 1.0;
        }
        for t in (0..t_len - 1).rev() {
            for s in 0..NUM_STATES {
                let mut sum = 0.0;
                for n in 0..NUM_STATES {
                    sum += self.transition[s][n] * self.emission[n][obs[t + 1]] * beta[t + 1][n];
                }
                beta[t][s] = if scale[t + 1] > 0.0 { sum / scale[t + 1] } else { 0.0 };
            }
        }

        // State and pair posteriors.
        let mut gamma = vec![[0.0f64; NUM_STATES]; t_len];
        for t in 0..t_len {
            let mut denom = 0.0;
            for s in 0..NUM_STATES {
                gamma[t][s] = alpha[t][s] * beta[t][s];
                denom += gamma[t][s];
            }
            if denom > 0.0 {
                for s in 0..NUM_STATES {
                    gamma[t][s] /= denom;
                }
            }
        }

        let mut xi_sum = [[0.0f64; NUM_STATES]; NUM_STATES];
        for t in 0..t_len - 1 {
            let mut denom = 0.0;
            let mut xi_t = [[0.0f64; NUM_STATES]; NUM_STATES];
            for p in 0..NUM_STATES {
                for s in 0..NUM_STATES {
                    xi_t[p][s] = alpha[t][p]
                        * self.transition[p][s]
                        * self.emission[s][obs[t + 1]]
                        * beta[t + 1][s];
                    denom += xi_t[p][s];
                }
            }
            if denom > 0.0 {
                for p in 0..NUM_STATES {
                    for s in 0..NUM_STATES {
                        xi_sum[p][s] += xi_t[p][s] / denom;
                    }
                }
            }
        }

        // Re-estimate initial, transition, emission (with probability floor).
        self.initial = gamma[0];
        floor_and_normalize(&mut self.initial);

        for p in 0..NUM_STATES {
            let gamma_sum: f64 = (0..t_len - 1).map(|t| gamma[t][p]).sum();
            if gamma_sum > 0.0 {
                for s in 0..NUM_STATES {
                    self.transition[p][s] = xi_sum[p][s] / gamma_sum;
                }
            }
            floor_and_normalize(&mut self.transition[p]);
        }

        for s in 0..NUM_STATES {
            let gamma_total: f64 = (0..t_len).map(|t| gamma[t][s]).sum();
            if gamma_total > 0.0 {
                let mut new_emission = [0.0f64; NUM_OBSERVATIONS];
                for t in 0..t_len {
                    new_emission[obs[t]] += gamma[t][s];
                }
                for o in 0..NUM_OBSERVATIONS {
                    self.emission[s][o] = new_emission[o] / gamma_total;
                }
            }
            floor_and_normalize(&mut self.emission[s]);
        }

        log_likelihood
    }
}

// ---------------------------------------------------------------------------
// Bucketing
// ---------------------------------------------------------------------------

fn ret_bucket(ret_pct: f64) -> usize {
    if ret_pct < -1.5 {
        0
    } else if ret_pct < -0.3 {
        1
    } else if ret_pct <= 0.3 {
        2
    } else if ret_pct <= 1.5 {
        3
    } else {
        4
    }
}

fn vol_bucket(range_pct: f64) -> usize {
    if range_pct < 0.5 {
        0
    } else if range_pct < 2.0 {
        1
    } else {
        2
    }
}

fn volume_bucket(ratio: f64) -> usize {
    if ratio < 0.8 {
        0
    } else if ratio <= 1.5 {
        1
    } else {
        2
    }
}

// ---------------------------------------------------------------------------
// Numeric helpers
// ---------------------------------------------------------------------------

fn ln(p: f64) -> f64 {
    if p <= 0.0 {
        f64::NEG_INFINITY
    } else {
        p.ln()
    }
}

/// Normalize a probability row in place, returning the pre-normalization sum
/// (the scaling factor).
fn normalize_step(row: &mut [f64; NUM_STATES]) -> f64 {
    let sum: f64 = row.iter().sum();
    if sum > 0.0 {
        for v in row.iter_mut() {
            *v /= sum;
        }
    }
    sum
}

fn floor_and_normalize(row: &mut [f64]) {
    for v in row.iter_mut() {
        if !v.is_finite() || *v < PROB_FLOOR {
            *v = PROB_FLOOR;
        }
    }
    let sum: f64 = row.iter().sum();
    for v in row.iter_mut() {
        *v /= sum;
    }
}
