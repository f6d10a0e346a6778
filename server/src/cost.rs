//! Per-session cost tracking for billable upstream services.
//!
//! Each session gets its own tracker at start; totals are frozen into a
//! final breakdown when the session ends. A rolling one-hour window feeds
//! the threshold alarm, throttled so the admin hears at most one warning
//! per cooldown.

use crate::config::UnitPrices;
use shared::ServiceCost;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BillableService {
    /// Units: seconds of captured speech.
    Transcription,
    /// Units: translated characters.
    Translation,
    /// Units: synthesized characters.
    SynthesisNeural,
    SynthesisStandard,
}

impl BillableService {
    pub fn label(&self) -> &'static str {
        match self {
            BillableService::Transcription => "transcription",
            BillableService::Translation => "translation",
            BillableService::SynthesisNeural => "synthesis-neural",
            BillableService::SynthesisStandard => "synthesis-standard",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CostWarningEvent {
    pub projected_hourly_usd: f64,
    pub threshold_usd: f64,
}

#[derive(Default)]
struct CostState {
    units: HashMap<BillableService, f64>,
    window: VecDeque<(Instant, f64)>,
    last_warning: Option<Instant>,
}

pub struct CostTracker {
    prices: UnitPrices,
    threshold_usd: f64,
    cooldown: Duration,
    state: Mutex<CostState>,
}

impl CostTracker {
    pub fn new(prices: UnitPrices, threshold_usd: f64, cooldown: Duration) -> Self {
        Self {
            prices,
            threshold_usd,
            cooldown,
            state: Mutex::new(CostState::default()),
        }
    }

    fn unit_price(&self, service: BillableService) -> f64 {
        match service {
            BillableService::Transcription => self.prices.transcription_per_sec,
            BillableService::Translation => self.prices.translation_per_char,
            BillableService::SynthesisNeural => self.prices.synthesis_neural_per_char,
            BillableService::SynthesisStandard => self.prices.synthesis_standard_per_char,
        }
    }

    /// Records consumed units and returns a warning event when the
    /// projected hourly spend crosses the threshold (at most once per
    /// cooldown).
    pub fn record(&self, service: BillableService, units: f64) -> Option<CostWarningEvent> {
        self.record_at(service, units, Instant::now())
    }

    pub(crate) fn record_at(
        &self,
        service: BillableService,
        units: f64,
        now: Instant,
    ) -> Option<CostWarningEvent> {
        let cost = units * self.unit_price(service);
        let mut state = self.state.lock().expect("cost tracker poisoned");
        *state.units.entry(service).or_insert(0.0) += units;
        state.window.push_back((now, cost));
        while let Some((stamp, _)) = state.window.front() {
            if now.duration_since(*stamp) > WINDOW {
                state.window.pop_front();
            } else {
                break;
            }
        }

        let hourly: f64 = state.window.iter().map(|(_, c)| c).sum();
        if hourly <= self.threshold_usd {
            return None;
        }
        let throttled = state
            .last_warning
            .is_some_and(|last| now.duration_since(last) < self.cooldown);
        if throttled {
            return None;
        }
        state.last_warning = Some(now);
        Some(CostWarningEvent {
            projected_hourly_usd: hourly,
            threshold_usd: self.threshold_usd,
        })
    }

    /// Final per-service breakdown for the session-end summary.
    pub fn summary(&self) -> (Vec<ServiceCost>, f64) {
        let state = self.state.lock().expect("cost tracker poisoned");
        let mut services: Vec<ServiceCost> = state
            .units
            .iter()
            .map(|(service, units)| ServiceCost {
                service: service.label().to_string(),
                units: *units,
                cost_usd: units * self.unit_price(*service),
            })
            .collect();
        services.sort_by(|a, b| a.service.cmp(&b.service));
        let total = services.iter().map(|s| s.cost_usd).sum();
        (services, total)
    }

    /// Total synthesized characters, used by tests and the health surface.
    pub fn synthesis_units(&self) -> f64 {
        let state = self.state.lock().expect("cost tracker poisoned");
        state
            .units
            .get(&BillableService::SynthesisNeural)
            .copied()
            .unwrap_or(0.0)
            + state
                .units
                .get(&BillableService::SynthesisStandard)
                .copied()
                .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prices() -> UnitPrices {
        UnitPrices {
            synthesis_neural_per_char: 0.01,
            synthesis_standard_per_char: 0.005,
            translation_per_char: 0.001,
            transcription_per_sec: 0.0004,
        }
    }

    #[test]
    fn test_totals_accumulate() {
        let tracker = CostTracker::new(prices(), 100.0, Duration::from_secs(600));
        tracker.record(BillableService::SynthesisNeural, 50.0);
        tracker.record(BillableService::SynthesisNeural, 25.0);
        tracker.record(BillableService::Translation, 100.0);

        let (services, total) = tracker.summary();
        assert_eq!(services.len(), 2);
        let synth = services
            .iter()
            .find(|s| s.service == "synthesis-neural")
            .unwrap();
        assert_eq!(synth.units, 75.0);
        assert!((synth.cost_usd - 0.75).abs() < 1e-9);
        assert!((total - 0.85).abs() < 1e-9);
    }

    #[test]
    fn test_warning_fires_once_per_cooldown() {
        let tracker = CostTracker::new(prices(), 1.0, Duration::from_secs(600));
        let start = Instant::now();

        // 150 chars * $0.01 = $1.50 > $1 threshold.
        let first = tracker.record_at(BillableService::SynthesisNeural, 150.0, start);
        assert!(first.is_some());
        assert!(first.unwrap().projected_hourly_usd > 1.0);

        // Still over threshold but inside the cooldown: silent.
        assert!(tracker
            .record_at(BillableService::SynthesisNeural, 150.0, start + Duration::from_secs(60))
            .is_none());

        // Past the cooldown: one more warning.
        assert!(tracker
            .record_at(BillableService::SynthesisNeural, 150.0, start + Duration::from_secs(601))
            .is_some());
    }

    #[test]
    fn test_window_expires_old_spend() {
        let tracker = CostTracker::new(prices(), 1.0, Duration::from_secs(0));
        let start = Instant::now();

        assert!(tracker
            .record_at(BillableService::SynthesisNeural, 150.0, start)
            .is_some());

        // Two hours later the window is empty; small spend stays quiet.
        assert!(tracker
            .record_at(
                BillableService::SynthesisNeural,
                10.0,
                start + Duration::from_secs(7200)
            )
            .is_none());

        // Lifetime totals are unaffected by the window.
        let (_, total) = tracker.summary();
        assert!((total - 1.6).abs() < 1e-9);
    }

    #[test]
    fn test_under_threshold_is_silent() {
        let tracker = CostTracker::new(prices(), 3.0, Duration::from_secs(600));
        for _ in 0..10 {
            assert!(tracker.record(BillableService::Translation, 100.0).is_none());
        }
    }

    #[test]
    fn test_synthesis_units() {
        let tracker = CostTracker::new(prices(), 100.0, Duration::from_secs(600));
        assert_eq!(tracker.synthesis_units(), 0.0);
        tracker.record(BillableService::SynthesisNeural, 10.0);
        tracker.record(BillableService::SynthesisStandard, 5.0);
        tracker.record(BillableService::Translation, 50.0);
        assert_eq!(tracker.synthesis_units(), 15.0);
    }
}
