//! Fare calculation for completed rides.

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, DispatchError, DispatchResult};

/// Base fare in currency units.
pub const BASE_FARE: f64 = 2.50;

/// Minimum charge for any ride.
pub const MIN_FARE: f64 = 5.00;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RideType {
    Bike,
    Car,
    CarPlus,
    Premium,
}

impl RideType {
    pub const ALL: [RideType; 4] = [
        RideType::Bike,
        RideType::Car,
        RideType::CarPlus,
        RideType::Premium,
    ];
}

/// Per-kilometer rate for each ride type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerKmRates {
    pub bike: f64,
    pub car: f64,
    pub car_plus: f64,
    pub premium: f64,
}

impl PerKmRates {
    pub fn rate(&self, ride_type: RideType) -> f64 {
        match ride_type {
            RideType::Bike => self.bike,
            RideType::Car => self.car,
            RideType::CarPlus => self.car_plus,
            RideType::Premium => self.premium,
        }
    }
}

impl Default for PerKmRates {
    fn default() -> Self {
        Self {
            bike: 0.8,
            car: 1.2,
            car_plus: 1.5,
            premium: 2.0,
        }
    }
}

/// Tunable pricing table.
///
/// Formula: `total = max(base_fare + distance_km * per_km(ride_type), min_fare)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FareConfig {
    pub base_fare: f64,
    pub per_km: PerKmRates,
    pub min_fare: f64,
    /// Display totals are rounded up to a multiple of this unit.
    pub display_unit: f64,
}

impl Default for FareConfig {
    fn default() -> Self {
        Self {
            base_fare: BASE_FARE,
            per_km: PerKmRates::default(),
            min_fare: MIN_FARE,
            display_unit: 1.0,
        }
    }
}

impl FareConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rates = RideType::ALL.map(|ride_type| self.per_km.rate(ride_type));
        let all_non_negative = [self.base_fare, self.min_fare]
            .iter()
            .chain(rates.iter())
            .all(|value| value.is_finite() && *value >= 0.0);
        if !all_non_negative {
            return Err(ConfigError::Invalid(
                "fare amounts must be finite and non-negative".to_string(),
            ));
        }
        if !(self.display_unit.is_finite() && self.display_unit > 0.0) {
            return Err(ConfigError::Invalid(
                "fare display_unit must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FareQuote {
    pub ride_type: RideType,
    pub base_fare: f64,
    pub per_km_rate: f64,
    pub min_fare: f64,
    pub distance_km: f64,
    /// Full-precision amount; this is what gets stored and credited.
    pub total: f64,
    /// `total` rounded up to the display unit.
    pub display_total: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FareCalculator {
    config: FareConfig,
}

impl FareCalculator {
    pub fn new(config: FareConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FareConfig {
        &self.config
    }

    /// Price a ride of `distance_km`. Pure: depends only on the table and inputs.
    pub fn quote(&self, ride_type: RideType, distance_km: f64) -> DispatchResult<FareQuote> {
        if !distance_km.is_finite() || distance_km < 0.0 {
            return Err(DispatchError::InvalidInput(format!(
                "distance must be a non-negative number of km, got {distance_km}"
            )));
        }
        let per_km_rate = self.config.per_km.rate(ride_type);
        let total = (self.config.base_fare + distance_km * per_km_rate).max(self.config.min_fare);
        Ok(FareQuote {
            ride_type,
            base_fare: self.config.base_fare,
            per_km_rate,
            min_fare: self.config.min_fare,
            distance_km,
            total,
            display_total: round_up_to_unit(total, self.config.display_unit),
        })
    }
}

/// Round up to a multiple of `unit`, tolerating float noise just above a multiple.
fn round_up_to_unit(amount: f64, unit: f64) -> f64 {
    const EPSILON: f64 = 1e-9;
    ((amount / unit) - EPSILON).ceil().max(0.0) * unit
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn car_fare_for_five_km() {
        let calculator = FareCalculator::default();
        let quote = calculator.quote(RideType::Car, 5.0).expect("quote");
        assert!((quote.total - 8.5).abs() < 1e-12);
        assert_eq!(quote.display_total, 9.0);
        assert_eq!(quote.per_km_rate, 1.2);
    }

    #[test]
    fn short_rides_pay_minimum_fare() {
        let calculator = FareCalculator::default();
        for ride_type in RideType::ALL {
            let quote = calculator.quote(ride_type, 0.0).expect("quote");
            assert_eq!(quote.total, MIN_FARE);
        }
        let bike = calculator.quote(RideType::Bike, 2.0).expect("quote");
        assert_eq!(bike.total, MIN_FARE);
    }

    #[test]
    fn display_total_ignores_float_noise() {
        assert_eq!(round_up_to_unit(8.000_000_000_01, 1.0), 8.0);
        assert_eq!(round_up_to_unit(8.01, 1.0), 9.0);
        assert!((round_up_to_unit(8.501, 0.05) - 8.55).abs() < 1e-9);
    }

    #[test]
    fn rejects_negative_distance() {
        let calculator = FareCalculator::default();
        assert!(calculator.quote(RideType::Car, -1.0).is_err());
        assert!(calculator.quote(RideType::Car, f64::NAN).is_err());
    }

    #[test]
    fn config_round_trips_through_json() {
        let json = r#"{"base_fare": 3.0, "per_km": {"bike": 1, "car": 2, "car_plus": 3, "premium": 4}}"#;
        let config: FareConfig = serde_json::from_str(json).expect("parse");
        assert_eq!(config.base_fare, 3.0);
        assert_eq!(config.min_fare, MIN_FARE);
        assert_eq!(config.per_km.rate(RideType::Premium), 4.0);
        config.validate().expect("valid");
    }
}
