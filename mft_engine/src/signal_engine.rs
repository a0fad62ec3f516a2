/// signal_engine.rs — C4: acceptance state machine and signal candidates
///
/// Zone classification, acceptance tracking, and setup detection for one
/// closed bar's features. The acceptance side is modeled as an explicit
/// Mealy-machine enum rather than a pair of counters so that "reset on
/// leaving this side" is structural instead of an invariant callers have
/// to remember to maintain.
use crate::config::{OrderFlowConfig, SignalConfig};
use crate::types::{Action, Features1m, PriceZone, Signal, SignalType};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Acceptance {
    Inside,
    OutsideAbove { count: u32, locked_vah: f64, since: i64 },
    OutsideBelow { count: u32, locked_val: f64, since: i64 },
}

impl Acceptance {
    pub fn count_above(&self) -> u32 {
        match self {
            Acceptance::OutsideAbove { count, .. } => *count,
            _ => 0,
        }
    }

    pub fn count_below(&self) -> u32 {
        match self {
            Acceptance::OutsideBelow { count, .. } => *count,
            _ => 0,
        }
    }
}

struct Candidate {
    signal_type: SignalType,
    stop: f64,
    tp1: f64,
    tp2: f64,
    confidence: f64,
}

pub struct SignalEngine {
    sig_cfg: SignalConfig,
    of_cfg: OrderFlowConfig,
    tick_size: f64,
    stop_buffer_ticks: f64,
    cooldown_ms: i64,
    acceptance: Acceptance,
    prev_zone: Option<PriceZone>,
    last_signal_ts: Option<i64>,
}

impl SignalEngine {
    pub fn new(
        sig_cfg: SignalConfig,
        of_cfg: OrderFlowConfig,
        tick_size: f64,
        stop_buffer_ticks: f64,
        cooldown_minutes: i64,
    ) -> Self {
        Self {
            sig_cfg,
            of_cfg,
            tick_size,
            stop_buffer_ticks,
            cooldown_ms: cooldown_minutes * 60_000,
            acceptance: Acceptance::Inside,
            prev_zone: None,
            last_signal_ts: None,
        }
    }

    fn stop_buffer(&self) -> f64 {
        self.stop_buffer_ticks * self.tick_size
    }

    fn update_acceptance(&mut self, zone: PriceZone, ts_min: i64) {
        self.acceptance = match (zone, self.acceptance) {
            (PriceZone::AboveVah, Acceptance::OutsideAbove { count, locked_vah, since }) => {
                Acceptance::OutsideAbove { count: count + 1, locked_vah, since }
            }
            (PriceZone::AboveVah, _) => {
                Acceptance::OutsideAbove { count: 1, locked_vah: 0.0, since: ts_min }
            }
            (PriceZone::BelowVal, Acceptance::OutsideBelow { count, locked_val, since }) => {
                Acceptance::OutsideBelow { count: count + 1, locked_val, since }
            }
            (PriceZone::BelowVal, _) => {
                Acceptance::OutsideBelow { count: 1, locked_val: 0.0, since: ts_min }
            }
            (PriceZone::InsideVa, _) => Acceptance::Inside,
        };
    }

    /// Lock the VAH/VAL for the sequence that just started, since the
    /// lock must reflect the boundary at sequence start, not the latest bar.
    fn lock_boundary(&mut self, va_vah: f64, va_val: f64) {
        self.acceptance = match self.acceptance {
            Acceptance::OutsideAbove { count, locked_vah, since } if locked_vah == 0.0 => {
                Acceptance::OutsideAbove { count, locked_vah: va_vah, since }
            }
            Acceptance::OutsideBelow { count, locked_val, since } if locked_val == 0.0 => {
                Acceptance::OutsideBelow { count, locked_val: va_val, since }
            }
            other => other,
        };
    }

    fn of_gate(&self, features: &Features1m, is_long: bool, is_breakout: bool, is_fail: bool) -> bool {
        let of = &features.order_flow;
        let (of_min, of_norm_min) = if is_breakout {
            (self.sig_cfg.of_breakout_min, self.sig_cfg.of_breakout_min_norm)
        } else if is_fail {
            (self.sig_cfg.of_fail_max, self.sig_cfg.of_fail_max_norm)
        } else {
            (self.sig_cfg.of_entry_min, self.sig_cfg.of_entry_min_norm)
        };

        // Same gate shape for entry, breakout, and fail checks; only the
        // threshold pair selected above differs between them. A failed
        // breakout wants to see flow turning back the way the setup
        // trades, same direction as an entry or breakout confirmation.
        let of_ok = if is_long {
            of.of_1m >= of_min || of.of_norm_1m >= of_norm_min
        } else {
            of.of_1m <= -of_min || of.of_norm_1m <= -of_norm_min
        };

        let qimb_ok = if !self.of_cfg.use_qimb {
            true
        } else {
            let threshold = if is_breakout {
                self.of_cfg.qimb_breakout_min
            } else if is_fail {
                self.of_cfg.qimb_fail_max
            } else {
                self.of_cfg.qimb_entry_min
            };
            if is_long {
                features.qimb_ema >= threshold
            } else {
                features.qimb_ema <= -threshold
            }
        };

        of_ok && qimb_ok
    }

    fn breakin_candidate(&self, features: &Features1m, is_long: bool) -> Option<Candidate> {
        if !self.of_gate(features, is_long, false, false) {
            return None;
        }
        let va = &features.va;
        let (stop, tp1, tp2) = if is_long {
            (va.val - self.stop_buffer(), va.poc, va.vah)
        } else {
            (va.vah + self.stop_buffer(), va.poc, va.val)
        };
        Some(Candidate {
            signal_type: if is_long { SignalType::BreakinLong } else { SignalType::BreakinShort },
            stop,
            tp1,
            tp2,
            confidence: 1.0,
        })
    }

    fn failed_breakout_candidate(&self, features: &Features1m, is_long: bool, consec: u32) -> Option<Candidate> {
        let k = self.sig_cfg.accept_outside_k;
        if !(1..k).contains(&consec) {
            return None;
        }
        if !self.of_gate(features, is_long, false, true) {
            return None;
        }
        let va = &features.va;
        let (stop, tp1, tp2) = if is_long {
            (va.val - self.stop_buffer(), va.poc, va.vah)
        } else {
            (va.vah + self.stop_buffer(), va.poc, va.val)
        };
        Some(Candidate {
            signal_type: if is_long {
                SignalType::FailedBreakoutLong
            } else {
                SignalType::FailedBreakoutShort
            },
            stop,
            tp1,
            tp2,
            confidence: 1.0,
        })
    }

    fn breakout_candidate(&self, features: &Features1m, is_long: bool, consec: u32) -> Option<Candidate> {
        let k = self.sig_cfg.accept_outside_k;
        if consec < k {
            return None;
        }
        if !self.of_gate(features, is_long, true, false) {
            return None;
        }
        let va = &features.va;
        let mid = features.mid_close;
        let (stop, sign) = if is_long {
            let locked = match self.acceptance {
                Acceptance::OutsideAbove { locked_vah, .. } if locked_vah > 0.0 => locked_vah,
                _ => va.vah,
            };
            (locked - self.stop_buffer(), 1.0)
        } else {
            let locked = match self.acceptance {
                Acceptance::OutsideBelow { locked_val, .. } if locked_val > 0.0 => locked_val,
                _ => va.val,
            };
            (locked + self.stop_buffer(), -1.0)
        };
        let r = (mid - stop) * sign;
        let tp1 = mid + sign * r;
        let tp2 = mid + sign * 2.0 * r;
        Some(Candidate {
            signal_type: if is_long { SignalType::BreakoutLong } else { SignalType::BreakoutShort },
            stop,
            tp1,
            tp2,
            confidence: 0.9,
        })
    }

    /// Process one closed bar's features and emit a `Signal`.
    pub fn process(&mut self, features: &Features1m) -> Signal {
        if !features.va.is_valid {
            return Signal::hold(features.ts_min, "invalid value area");
        }

        let zone = features.va.zone_of(features.mid_close);
        let prev_zone = self.prev_zone;
        // Snapshot the sequence counts BEFORE this bar's update: a re-entry
        // bar's zone is InsideVa, which would otherwise reset the counter
        // to zero before the failed-breakout check ever sees how long the
        // preceding excursion lasted.
        let pre_count_above = self.acceptance.count_above();
        let pre_count_below = self.acceptance.count_below();
        self.update_acceptance(zone, features.ts_min);
        self.lock_boundary(features.va.vah, features.va.val);

        let mut candidates: Vec<Candidate> = Vec::new();

        if let Some(prev) = prev_zone {
            if zone == PriceZone::InsideVa {
                match prev {
                    PriceZone::BelowVal => {
                        if let Some(c) = self.failed_breakout_candidate(features, true, pre_count_below) {
                            candidates.push(c);
                        } else if let Some(c) = self.breakin_candidate(features, true) {
                            candidates.push(c);
                        }
                    }
                    PriceZone::AboveVah => {
                        if let Some(c) = self.failed_breakout_candidate(features, false, pre_count_above) {
                            candidates.push(c);
                        } else if let Some(c) = self.breakin_candidate(features, false) {
                            candidates.push(c);
                        }
                    }
                    PriceZone::InsideVa => {}
                }
            }
        }

        if zone == PriceZone::AboveVah {
            if let Some(c) = self.breakout_candidate(features, true, self.acceptance.count_above()) {
                candidates.push(c);
            }
        } else if zone == PriceZone::BelowVal {
            if let Some(c) = self.breakout_candidate(features, false, self.acceptance.count_below()) {
                candidates.push(c);
            }
        }

        self.prev_zone = Some(zone);

        if candidates.is_empty() {
            return Signal::hold(features.ts_min, "no setup");
        }

        if let Some(last_ts) = self.last_signal_ts {
            if features.ts_min - last_ts < self.cooldown_ms {
                return Signal::hold(features.ts_min, "cooldown active");
            }
        }

        candidates.sort_by_key(|c| c.signal_type.priority());
        let chosen = candidates.into_iter().next().unwrap();
        self.last_signal_ts = Some(features.ts_min);

        Signal {
            ts_min: features.ts_min,
            signal_type: Some(chosen.signal_type),
            action: if chosen.signal_type.is_long() { Action::EnterLong } else { Action::EnterShort },
            stop: Some(chosen.stop),
            tp1: Some(chosen.tp1),
            tp2: Some(chosen.tp2),
            confidence: chosen.confidence,
            strategy_tag: chosen.signal_type.strategy_tag().to_string(),
            reason: format!("{:?}", chosen.signal_type),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderFlowMetrics, ValueArea};

    fn features(ts_min: i64, mid: f64, va: ValueArea, of_1m: f64, of_norm: f64, qimb_ema: f64) -> Features1m {
        Features1m {
            ts_min,
            mid_close: mid,
            sigma_240: 0.01,
            bin_width: 100.0,
            va,
            order_flow: OrderFlowMetrics { of_1m, of_norm_1m: of_norm, total_volume: 100.0, buy_volume: 60.0, sell_volume: 40.0, ambiguous_volume: 0.0, ambiguous_frac: 0.0 },
            qimb_close: qimb_ema,
            qimb_ema,
            spread_avg_60m: 0.2,
        }
    }

    fn default_va() -> ValueArea {
        ValueArea { poc: 42_000.0, vah: 42_200.0, val: 41_800.0, coverage: 0.7, bin_count: 5, total_volume: 100.0, bin_width: 100.0, is_valid: true }
    }

    #[test]
    fn scenario_s1_breakin_long() {
        let mut eng = SignalEngine::new(SignalConfig::default(), OrderFlowConfig::default(), 0.1, 2.0, 5);
        let va = default_va();
        eng.process(&features(0, 41_700.0, va, 0.0, 0.0, 0.0));
        let sig = eng.process(&features(60_000, 42_000.0, va, 100.0, 0.5, 0.2));
        assert_eq!(sig.signal_type, Some(SignalType::BreakinLong));
        assert!((sig.stop.unwrap() - 41_799.8).abs() < 1e-9);
        assert_eq!(sig.tp1, Some(42_000.0));
        assert_eq!(sig.tp2, Some(42_200.0));
    }

    #[test]
    fn scenario_s2_breakout_long() {
        let mut eng = SignalEngine::new(
            SignalConfig { accept_outside_k: 3, ..Default::default() },
            OrderFlowConfig::default(),
            0.1,
            2.0,
            5,
        );
        let va = default_va();
        eng.process(&features(0, 41_900.0, va, 0.0, 0.0, 0.0)); // inside, establish prev_zone
        eng.process(&features(60_000, 42_250.0, va, 50.0, 0.3, 0.2));
        eng.process(&features(120_000, 42_260.0, va, 50.0, 0.3, 0.2));
        let sig = eng.process(&features(180_000, 42_280.0, va, 50.0, 0.3, 0.2));
        assert_eq!(sig.signal_type, Some(SignalType::BreakoutLong));
        let stop = sig.stop.unwrap();
        assert!((stop - 42_199.8).abs() < 1e-9, "stop = {stop}");
        let r = 42_280.0 - stop;
        assert!((sig.tp1.unwrap() - (42_280.0 + r)).abs() < 1e-6);
        assert!((sig.tp2.unwrap() - (42_280.0 + 2.0 * r)).abs() < 1e-6);
    }

    #[test]
    fn scenario_s3_failed_breakout_short() {
        let mut eng = SignalEngine::new(
            SignalConfig { accept_outside_k: 3, ..Default::default() },
            OrderFlowConfig::default(),
            0.1,
            2.0,
            5,
        );
        let va = default_va();
        eng.process(&features(0, 41_900.0, va, 0.0, 0.0, 0.0));
        eng.process(&features(60_000, 42_250.0, va, -10.0, -0.1, -0.2));
        let sig = eng.process(&features(120_000, 42_000.0, va, -80.0, -0.5, -0.2));
        assert_eq!(sig.signal_type, Some(SignalType::FailedBreakoutShort));
        assert!((sig.stop.unwrap() - 42_200.2).abs() < 1e-9);
        assert_eq!(sig.tp1, Some(42_000.0));
        assert_eq!(sig.tp2, Some(41_800.0));
    }

    #[test]
    fn cooldown_blocks_second_signal() {
        let mut eng = SignalEngine::new(SignalConfig::default(), OrderFlowConfig::default(), 0.1, 2.0, 5);
        let va = default_va();
        eng.process(&features(0, 41_700.0, va, 0.0, 0.0, 0.0));
        let sig1 = eng.process(&features(60_000, 42_000.0, va, 100.0, 0.5, 0.2));
        assert!(sig1.signal_type.is_some());
        eng.process(&features(120_000, 41_700.0, va, 0.0, 0.0, 0.0));
        let sig2 = eng.process(&features(180_000, 42_000.0, va, 100.0, 0.5, 0.2));
        assert_eq!(sig2.action, Action::Hold);
    }

    #[test]
    fn invalid_va_holds() {
        let mut eng = SignalEngine::new(SignalConfig::default(), OrderFlowConfig::default(), 0.1, 2.0, 5);
        let va = ValueArea::invalid(1.0);
        let sig = eng.process(&features(0, 100.0, va, 0.0, 0.0, 0.0));
        assert_eq!(sig.action, Action::Hold);
    }
}
