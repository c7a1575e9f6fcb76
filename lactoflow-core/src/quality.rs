//! Derived quality metrics: weighted quality score, price estimate,
//! traffic-light cards and the rule-based milk-type fallback classifier.

use serde::{Deserialize, Serialize};

use crate::types::MilkType;

/// Low/high band for one traffic card.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub low: f64,
    pub high: f64,
}

/// Configuration for derived quality metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Base price per litre before the quality multiplier (default: 33.0).
    pub base_price: f64,
    /// Weights for FAT, SNF and TS in the quality score.
    pub fat_weight: f64,
    pub snf_weight: f64,
    pub ts_weight: f64,
    /// Adulteration risk (0-100) above which a sample is flagged (default: 50.0).
    pub adulteration_threshold: f64,
    pub fat_band: Band,
    pub snf_band: Band,
    pub ts_band: Band,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            base_price: 33.0,
            fat_weight: 0.40,
            snf_weight: 0.35,
            ts_weight: 0.25,
            adulteration_threshold: 50.0,
            fat_band: Band {
                low: 3.5,
                high: 4.5,
            },
            snf_band: Band {
                low: 8.0,
                high: 9.0,
            },
            ts_band: Band {
                low: 11.5,
                high: 13.5,
            },
        }
    }
}

impl QualityConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.base_price <= 0.0 {
            errors.push("quality.base_price must be positive".to_string());
        }
        if self.adulteration_threshold < 0.0 || self.adulteration_threshold > 100.0 {
            errors.push("quality.adulteration_threshold must be within 0..=100".to_string());
        }
        for (name, band) in [
            ("fat_band", self.fat_band),
            ("snf_band", self.snf_band),
            ("ts_band", self.ts_band),
        ] {
            if band.low > band.high {
                errors.push(format!("quality.{name}: low must not exceed high"));
            }
        }
        errors
    }
}

/// Traffic-light classification of a single metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficLight {
    Red,
    Yellow,
    Green,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrafficCard {
    pub value: Option<f64>,
    pub risk: TrafficLight,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrafficCards {
    pub fat: TrafficCard,
    pub snf: TrafficCard,
    pub ts: TrafficCard,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceEstimate {
    pub base_price: f64,
    pub quality_score: f64,
    pub final_price: f64,
}

/// Classify a value against a band: red below `low`, green at or above `high`.
pub fn classify_traffic(value: Option<f64>, band: Band) -> TrafficLight {
    match value {
        Some(v) if v.is_finite() => {
            if v < band.low {
                TrafficLight::Red
            } else if v >= band.high {
                TrafficLight::Green
            } else {
                TrafficLight::Yellow
            }
        }
        _ => TrafficLight::Unknown,
    }
}

pub fn traffic_cards(
    fat: Option<f64>,
    snf: Option<f64>,
    ts: Option<f64>,
    config: &QualityConfig,
) -> TrafficCards {
    let card = |value, band| TrafficCard {
        value,
        risk: classify_traffic(value, band),
    };
    TrafficCards {
        fat: card(fat, config.fat_band),
        snf: card(snf, config.snf_band),
        ts: card(ts, config.ts_band),
    }
}

/// Weighted quality score; zero when any component is missing.
pub fn quality_score(
    fat: Option<f64>,
    snf: Option<f64>,
    ts: Option<f64>,
    config: &QualityConfig,
) -> f64 {
    match (fat, snf, ts) {
        (Some(fat), Some(snf), Some(ts)) => {
            fat * config.fat_weight + snf * config.snf_weight + ts * config.ts_weight
        }
        _ => 0.0,
    }
}

/// Price from the quality score: score/10 clamped to a 0.5..=1.5 multiplier.
pub fn price_estimate(score: f64, config: &QualityConfig) -> PriceEstimate {
    let multiplier = (score / 10.0).clamp(0.5, 1.5);
    PriceEstimate {
        base_price: config.base_price,
        quality_score: round_to(score, 3),
        final_price: round_to(config.base_price * multiplier, 2),
    }
}

/// Rule-based milk-type classifier used when the predictor returns none.
///
/// Rules are evaluated in order; plant-based types are checked first.
pub fn classify_milk_type(fat: f64, snf: f64) -> MilkType {
    if fat < 1.5 && snf < 6.5 {
        return MilkType::Almond;
    }
    if fat < 2.0 && snf < 7.5 {
        return MilkType::Oat;
    }
    if (1.0..=2.5).contains(&fat) && (7.0..=9.0).contains(&snf) {
        return MilkType::Soy;
    }
    if fat > 6.0 && snf > 9.5 {
        return MilkType::Buffalo;
    }
    if fat > 2.0 && fat < 3.8 && (8.5..=9.5).contains(&snf) {
        return MilkType::Camel;
    }
    if fat < 4.0 && snf < 8.6 {
        return MilkType::Goat;
    }
    if (3.2..=5.8).contains(&fat) && (8.0..=9.8).contains(&snf) {
        return MilkType::Cow;
    }
    MilkType::Unknown
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_score_weights() {
        let config = QualityConfig::default();
        let score = quality_score(Some(4.0), Some(8.5), Some(12.5), &config);
        assert!((score - (1.6 + 2.975 + 3.125)).abs() < 1e-12);
    }

    #[test]
    fn test_quality_score_missing_component() {
        let config = QualityConfig::default();
        assert_eq!(quality_score(Some(4.0), None, Some(12.5), &config), 0.0);
    }

    #[test]
    fn test_price_multiplier_clamped() {
        let config = QualityConfig::default();
        assert_eq!(price_estimate(2.0, &config).final_price, 16.5);
        assert_eq!(price_estimate(30.0, &config).final_price, 49.5);
        assert_eq!(price_estimate(7.7, &config).final_price, 25.41);
    }

    #[test]
    fn test_traffic_classification() {
        let band = Band {
            low: 3.5,
            high: 4.5,
        };
        assert_eq!(classify_traffic(Some(3.0), band), TrafficLight::Red);
        assert_eq!(classify_traffic(Some(4.0), band), TrafficLight::Yellow);
        assert_eq!(classify_traffic(Some(4.5), band), TrafficLight::Green);
        assert_eq!(classify_traffic(None, band), TrafficLight::Unknown);
        assert_eq!(classify_traffic(Some(f64::NAN), band), TrafficLight::Unknown);
    }

    #[test]
    fn test_milk_type_rules() {
        assert_eq!(classify_milk_type(1.0, 6.0), MilkType::Almond);
        assert_eq!(classify_milk_type(1.8, 7.2), MilkType::Oat);
        assert_eq!(classify_milk_type(2.2, 8.0), MilkType::Soy);
        assert_eq!(classify_milk_type(7.0, 10.0), MilkType::Buffalo);
        assert_eq!(classify_milk_type(3.0, 9.0), MilkType::Camel);
        assert_eq!(classify_milk_type(3.9, 8.4), MilkType::Goat);
        assert_eq!(classify_milk_type(4.2, 8.8), MilkType::Cow);
        assert_eq!(classify_milk_type(9.0, 5.0), MilkType::Unknown);
    }

    #[test]
    fn test_config_validation() {
        let mut config = QualityConfig::default();
        assert!(config.validate().is_empty());
        config.fat_band = Band {
            low: 5.0,
            high: 4.0,
        };
        config.base_price = 0.0;
        assert_eq!(config.validate().len(), 2);
    }
}
