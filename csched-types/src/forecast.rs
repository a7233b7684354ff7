//! Carbon intensity forecast (spec §3 `CarbonForecast`).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::ZoneKey;
use crate::metadata::TypesError;

/// One zone's hourly forecast, as produced by a single fetch cycle.
///
/// `hours` holds (hour-start UTC, gCO2/kWh) pairs. Construction enforces
/// "hours are contiguous and strictly increasing" and "values are
/// nonnegative"; it does not enforce the 24-hour minimum length (spec §8
/// explicitly allows forecasts shorter than the horizon, with the planner
/// recording that in `mode`).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CarbonForecast {
    pub zone: ZoneKey,
    pub fetched_at: DateTime<Utc>,
    pub hours: Vec<(DateTime<Utc>, f64)>,
}

impl CarbonForecast {
    pub fn new(
        zone: ZoneKey,
        fetched_at: DateTime<Utc>,
        hours: Vec<(DateTime<Utc>, f64)>,
    ) -> Result<Self, TypesError> {
        for pair in hours.windows(2) {
            let (prev_ts, _) = pair[0];
            let (next_ts, _) = pair[1];
            if next_ts - prev_ts != Duration::hours(1) {
                return Err(TypesError::Invariant(format!(
                    "forecast for zone {zone}: hours not contiguous/increasing at {prev_ts} -> {next_ts}"
                )));
            }
        }
        if hours.iter().any(|(_, v)| *v < 0.0) {
            return Err(TypesError::Invariant(format!(
                "forecast for zone {zone}: negative carbon intensity value"
            )));
        }
        Ok(Self {
            zone,
            fetched_at,
            hours,
        })
    }

    pub fn len(&self) -> usize {
        self.hours.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hours.is_empty()
    }

    /// Carbon intensity for the hour starting exactly at `hour_start`, if present.
    pub fn intensity_at(&self, hour_start: DateTime<Utc>) -> Option<f64> {
        self.hours
            .iter()
            .find(|(ts, _)| *ts == hour_start)
            .map(|(_, v)| *v)
    }

    pub fn covers_horizon(&self, horizon_start: DateTime<Utc>, horizon_hours: usize) -> bool {
        if self.hours.len() < horizon_hours {
            return false;
        }
        self.hours
            .first()
            .map(|(ts, _)| *ts <= horizon_start)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn hour(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 20, 0, 0, 0).unwrap() + Duration::hours(n)
    }

    #[test]
    fn rejects_non_contiguous_hours() {
        let hours = vec![(hour(0), 10.0), (hour(2), 20.0)];
        assert!(CarbonForecast::new("z1".into(), hour(0), hours).is_err());
    }

    #[test]
    fn rejects_negative_intensity() {
        let hours = vec![(hour(0), -1.0)];
        assert!(CarbonForecast::new("z1".into(), hour(0), hours).is_err());
    }

    #[test]
    fn accepts_contiguous_increasing_hours() {
        let hours: Vec<_> = (0..24).map(|i| (hour(i), 100.0)).collect();
        let f = CarbonForecast::new("z1".into(), hour(0), hours).unwrap();
        assert_eq!(f.len(), 24);
        assert!(f.covers_horizon(hour(0), 24));
    }

    #[test]
    fn short_forecast_does_not_cover_full_horizon() {
        let hours: Vec<_> = (0..10).map(|i| (hour(i), 100.0)).collect();
        let f = CarbonForecast::new("z1".into(), hour(0), hours).unwrap();
        assert!(!f.covers_horizon(hour(0), 24));
    }
}
