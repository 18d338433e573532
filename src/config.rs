use std::env;

use crate::error::DispatchError;
use crate::models::driver::VehicleType;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub event_buffer_size: usize,
    pub dispatch: DispatchConfig,
}

/// Engine tunables. Every constant the matching, routing, and tracking code
/// depends on comes through here rather than being hard-coded at the call
/// site.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// How long an offered driver has to accept or decline.
    pub offer_response_secs: i64,
    /// Period of the background deadline sweep.
    pub sweep_interval_secs: u64,
    /// Upper bound on offers per assignment before it fails.
    pub max_offer_rounds: u32,
    /// Fallback eligibility radius for drivers with no working zones.
    pub default_max_distance_km: f64,
    /// Speed model: minutes of travel per route kilometer.
    pub minutes_per_km: f64,
    pub minutes_per_km_bicycle: f64,
    pub minutes_per_km_motorcycle: f64,
    pub minutes_per_km_car: f64,
    /// Deviation from the planned route that raises an off_route exception.
    pub off_route_threshold_km: f64,
    /// No movement beyond stall_distance_km for this long raises stalled.
    pub stall_window_secs: i64,
    pub stall_distance_km: f64,
    /// Grace past the ETA before missed_window fires; also the on-time
    /// grace used in reporting.
    pub eta_grace_mins: i64,
}

impl DispatchConfig {
    pub fn minutes_per_km_for(&self, vehicle: Option<VehicleType>) -> f64 {
        match vehicle {
            Some(VehicleType::Bicycle) => self.minutes_per_km_bicycle,
            Some(VehicleType::Motorcycle) => self.minutes_per_km_motorcycle,
            Some(VehicleType::Car) => self.minutes_per_km_car,
            None => self.minutes_per_km,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            offer_response_secs: 60,
            sweep_interval_secs: 5,
            max_offer_rounds: 5,
            default_max_distance_km: 10.0,
            minutes_per_km: 2.0,
            minutes_per_km_bicycle: 3.0,
            minutes_per_km_motorcycle: 2.0,
            minutes_per_km_car: 2.0,
            off_route_threshold_km: 1.0,
            stall_window_secs: 300,
            stall_distance_km: 0.05,
            eta_grace_mins: 10,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, DispatchError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
            dispatch: DispatchConfig {
                offer_response_secs: parse_or_default("OFFER_RESPONSE_SECS", 60)?,
                sweep_interval_secs: parse_or_default("SWEEP_INTERVAL_SECS", 5)?,
                max_offer_rounds: parse_or_default("MAX_OFFER_ROUNDS", 5)?,
                default_max_distance_km: parse_or_default("DEFAULT_MAX_DISTANCE_KM", 10.0)?,
                minutes_per_km: parse_or_default("MINUTES_PER_KM", 2.0)?,
                minutes_per_km_bicycle: parse_or_default("MINUTES_PER_KM_BICYCLE", 3.0)?,
                minutes_per_km_motorcycle: parse_or_default("MINUTES_PER_KM_MOTORCYCLE", 2.0)?,
                minutes_per_km_car: parse_or_default("MINUTES_PER_KM_CAR", 2.0)?,
                off_route_threshold_km: parse_or_default("OFF_ROUTE_THRESHOLD_KM", 1.0)?,
                stall_window_secs: parse_or_default("STALL_WINDOW_SECS", 300)?,
                stall_distance_km: parse_or_default("STALL_DISTANCE_KM", 0.05)?,
                eta_grace_mins: parse_or_default("ETA_GRACE_MINS", 10)?,
            },
        })
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, DispatchError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| DispatchError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
