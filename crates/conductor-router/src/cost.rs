use conductor_core::policy::CostModel;

/// Costs are held as integer micro-USD so ledger commits never drift.
pub const MICROS_PER_USD: f64 = 1_000_000.0;

pub fn usd_to_micros(usd: f64) -> u64 {
    if !usd.is_finite() || usd <= 0.0 {
        return 0;
    }
    (usd * MICROS_PER_USD).round() as u64
}

pub fn micros_to_usd(micros: u64) -> f64 {
    micros as f64 / MICROS_PER_USD
}

/// Estimated cost, in micro-USD, of one invocation under `model`.
pub fn estimate_micros(model: &CostModel, payload_bytes: u64) -> u64 {
    match model {
        CostModel::Free => 0,
        CostModel::Flat { usd } => usd_to_micros(*usd),
        CostModel::Payload {
            base_usd,
            usd_per_kb,
            max_usd,
        } => {
            let variable = usd_per_kb * (payload_bytes as f64 / 1000.0);
            let total = usd_to_micros(base_usd + variable);
            total.min(usd_to_micros(*max_usd))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_and_free() {
        assert_eq!(estimate_micros(&CostModel::Free, 10_000), 0);
        assert_eq!(estimate_micros(&CostModel::Flat { usd: 0.2 }, 0), 200_000);
    }

    #[test]
    fn payload_scales_and_caps() {
        let model = CostModel::Payload {
            base_usd: 0.001,
            usd_per_kb: 0.001,
            max_usd: 0.01,
        };
        assert_eq!(estimate_micros(&model, 0), 1_000);
        assert_eq!(estimate_micros(&model, 5_000), 6_000);
        assert_eq!(estimate_micros(&model, 50_000), 10_000);
    }

    #[test]
    fn conversion_rounds() {
        assert_eq!(usd_to_micros(0.25), 250_000);
        assert_eq!(usd_to_micros(-3.0), 0);
        assert_eq!(usd_to_micros(f64::NAN), 0);
        assert!((micros_to_usd(250_000) - 0.25).abs() < f64::EPSILON);
    }
}
