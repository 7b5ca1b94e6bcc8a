//! Roughness math: vertical-acceleration dispersion and the empirical IRI
//! approximation derived from it.

use serde::Serialize;

/// Road condition category derived from the IRI estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoadCategory {
    Good,
    Fair,
    Poor,
    VeryPoor,
}

impl RoadCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
            Self::VeryPoor => "very_poor",
        }
    }
}

/// IRI model constants and category thresholds. K and the speed baseline
/// are empirical, so they stay configurable.
#[derive(Debug, Clone)]
pub struct IriConfig {
    pub k: f64,
    pub speed_baseline_kmh: f64,
    pub good: f64,
    pub fair: f64,
    pub poor: f64,
}

impl Default for IriConfig {
    fn default() -> Self {
        Self {
            k: 15.0,
            speed_baseline_kmh: 30.0,
            good: 2.5,
            fair: 4.0,
            poor: 6.0,
        }
    }
}

/// Population standard deviation, rounded to 2 decimals; 0 for fewer than
/// two samples. Deviation-from-mean form, so the ~1000 milli-g gravity
/// bias on the vertical axis cancels.
pub fn std_dev(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let n = xs.len() as f64;
    let mean = xs.iter().sum::<f64>() / n;
    let variance = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    (variance.sqrt() * 100.0).round() / 100.0
}

/// Empirical IRI (m/km) from vertical-axis dispersion and speed.
///
/// Below 5 km/h the vibration signal says nothing about the road, so the
/// estimate pins to (0, good). Otherwise
/// `iri = stdDev/1000 × K × (baseline/speed)`, clamped to [0, 20].
pub fn estimate_iri(xs: &[f64], speed_kmh: f64, cfg: &IriConfig) -> (f64, RoadCategory) {
    if speed_kmh < 5.0 {
        return (0.0, RoadCategory::Good);
    }
    let r = std_dev(xs);
    let speed_factor = cfg.speed_baseline_kmh / speed_kmh;
    let iri = (r / 1000.0 * cfg.k * speed_factor).clamp(0.0, 20.0);
    (iri, categorize(iri, cfg))
}

fn categorize(iri: f64, cfg: &IriConfig) -> RoadCategory {
    if iri < cfg.good {
        RoadCategory::Good
    } else if iri < cfg.fair {
        RoadCategory::Fair
    } else if iri < cfg.poor {
        RoadCategory::Poor
    } else {
        RoadCategory::VeryPoor
    }
}
