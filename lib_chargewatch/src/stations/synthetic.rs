use rand::Rng;

use crate::configs::config_sync::SyntheticConfig;
use crate::stations::model::{PortReading, PortStatus, SnapshotOrigin, StatusSnapshot, OCCUPIED_VOLTAGE};

/// Probability that a synthesized port is free.
pub const FREE_PROBABILITY: f64 = 0.7;
/// Range of the current drawn for a synthesized occupied port, in amperes.
pub const CURRENT_RANGE: std::ops::RangeInclusive<f64> = 8.0..=16.0;

/// Fabricates snapshots shaped after each station's configured port layout.
#[derive(Debug, Clone)]
pub struct SyntheticGenerator {
    config: SyntheticConfig,
}

impl SyntheticGenerator {
    pub fn new(config: SyntheticConfig) -> Self {
        Self { config }
    }

    pub fn generate(&self, station_id: &str, origin: SnapshotOrigin, now_ms: i64) -> StatusSnapshot {
        self.generate_with(&mut rand::rng(), station_id, origin, now_ms)
    }

    /// Same as [`generate`](Self::generate) with a caller-provided RNG.
    pub fn generate_with<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        station_id: &str,
        origin: SnapshotOrigin,
        now_ms: i64,
    ) -> StatusSnapshot {
        let profile = self.config.profile_for(station_id);
        let ports = (1..=i64::from(profile.port_count))
            .map(|port_number| {
                if rng.random_bool(FREE_PROBABILITY) {
                    PortReading::from_occupancy(port_number, PortStatus::Free, &profile.service, now_ms)
                } else {
                    let current: f64 = rng.random_range(CURRENT_RANGE);
                    PortReading {
                        port_number,
                        status: PortStatus::Occupied,
                        service: profile.service.clone(),
                        voltage: OCCUPIED_VOLTAGE,
                        current: (current * 10.0).round() / 10.0,
                        observed_at_ms: now_ms,
                    }
                }
            })
            .collect();

        StatusSnapshot {
            station_id: station_id.to_string(),
            ports,
            origin,
            fetched_at_ms: now_ms,
        }
    }
}
