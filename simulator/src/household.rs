//! Deterministic per-household consumption model.

use chrono::{DateTime, Datelike, Timelike, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Household {
    rng: StdRng,
    base_load: f64,
    peak_multiplier: f64,
    season_impact: f64,
}

impl Household {
    pub fn from_seed(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let base_load = 0.7 + rng.gen::<f64>() * 0.6;
        let peak_multiplier = 2.5 + rng.gen::<f64>();
        let season_impact = 0.3 + rng.gen::<f64>() * 0.6;
        Self {
            rng,
            base_load,
            peak_multiplier,
            season_impact,
        }
    }

    /// Same device id, same household profile and jitter sequence.
    pub fn for_device(device_id: &str) -> Self {
        Self::from_seed(device_seed(device_id))
    }

    pub fn daily_pattern(&self, hour: u32) -> f64 {
        match hour {
            7..=9 => self.peak_multiplier * 0.8,
            18..=22 => self.peak_multiplier,
            23 | 0..=5 => 0.8,
            10..=17 => 1.5,
            _ => 1.2,
        }
    }

    /// Peaks in winter, bottoms out in summer.
    pub fn seasonal_factor(&self, month: u32) -> f64 {
        let angle = (month.saturating_sub(1)) as f64 * (2.0 * PI / 12.0);
        angle.cos() * self.season_impact + 1.0
    }

    pub fn simulate_consumption(&mut self, at: DateTime<Utc>) -> f64 {
        let jitter = 0.85 + self.rng.gen::<f64>() * 0.3;
        self.base_load * self.daily_pattern(at.hour()) * self.seasonal_factor(at.month()) * jitter
    }
}

fn device_seed(device_id: &str) -> u64 {
    if let Ok(uuid) = Uuid::parse_str(device_id.trim()) {
        let bits = uuid.as_u128();
        return (bits >> 64) as u64 ^ bits as u64;
    }
    // FNV-1a
    device_id.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ byte as u64).wrapping_mul(0x0100_0000_01b3)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_same_device_same_sequence() {
        let at = Utc.with_ymd_and_hms(2024, 1, 15, 19, 0, 0).unwrap();
        let mut a = Household::for_device("be781b42-c3b0-475b-bdc5-cb467d0f7f1b");
        let mut b = Household::for_device("be781b42-c3b0-475b-bdc5-cb467d0f7f1b");
        for _ in 0..10 {
            assert_eq!(a.simulate_consumption(at), b.simulate_consumption(at));
        }

        let mut c = Household::for_device("dev-7");
        assert_ne!(
            Household::for_device("dev-8").simulate_consumption(at),
            c.simulate_consumption(at)
        );
    }

    #[test]
    fn test_daily_pattern_boundaries() {
        let household = Household::from_seed(42);
        let peak = household.peak_multiplier;
        assert_eq!(household.daily_pattern(7), peak * 0.8);
        assert_eq!(household.daily_pattern(9), peak * 0.8);
        assert_eq!(household.daily_pattern(10), 1.5);
        assert_eq!(household.daily_pattern(17), 1.5);
        assert_eq!(household.daily_pattern(18), peak);
        assert_eq!(household.daily_pattern(22), peak);
        assert_eq!(household.daily_pattern(23), 0.8);
        assert_eq!(household.daily_pattern(3), 0.8);
        assert_eq!(household.daily_pattern(6), 1.2);
    }

    #[test]
    fn test_seasonal_factor_peaks_in_winter() {
        let household = Household::from_seed(7);
        let january = household.seasonal_factor(1);
        let july = household.seasonal_factor(7);
        assert!((january - (1.0 + household.season_impact)).abs() < 1e-9);
        assert!((july - (1.0 - household.season_impact)).abs() < 1e-9);
        assert!(january > household.seasonal_factor(4));
    }

    #[test]
    fn test_consumption_within_model_bounds() {
        let mut household = Household::from_seed(1234);
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let expected = household.base_load * 1.5 * household.seasonal_factor(6);
        for _ in 0..100 {
            let value = household.simulate_consumption(at);
            assert!(value >= expected * 0.85 - 1e-9);
            assert!(value <= expected * 1.15 + 1e-9);
        }
    }
}
