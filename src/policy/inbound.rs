//! Inbound-fee sub-strategies.
//!
//! Pure functions of feature data. Inbound fees steer liquidity: a negative
//! rate (discount) attracts payments entering through the channel, a
//! positive rate discourages them. All results are in ppm.

/// Discount scaled by how much local balance the channel is sitting on.
///
/// High local balance means outbound liquidity we want routed back in, so
/// the discount grows with the ratio; a depleted channel keeps at most a
/// token discount.
pub fn liquidity_discount(local_balance_ratio: f64, intensity: f64) -> i32 {
    if local_balance_ratio > 0.8 {
        -(50.0 * intensity) as i32
    } else if local_balance_ratio > 0.6 {
        -(30.0 * intensity) as i32
    } else if local_balance_ratio > 0.4 {
        -(10.0 * intensity) as i32
    } else {
        (-(5.0 * intensity) as i32).max(-5)
    }
}

/// Premium or discount from the 7-day inbound/outbound volume ratio.
///
/// Ratio above 2 means the channel is already pulling too much inbound
/// flow and can charge for it; below 0.5 it needs a discount to attract
/// any; in between it stays neutral.
pub fn flow_ratio_fee(flow_in_7d_msat: u64, flow_out_7d_msat: u64) -> i32 {
    let flow_ratio = flow_in_7d_msat as f64 / (flow_out_7d_msat.max(1)) as f64;

    if flow_ratio > 2.0 {
        ((20.0 * flow_ratio) as i32).min(50)
    } else if flow_ratio < 0.5 && flow_ratio > 0.0 {
        (-(30.0 / flow_ratio) as i32).max(-100)
    } else if flow_ratio == 0.0 {
        // No inbound at all: maximum attraction discount.
        -100
    } else {
        0
    }
}

/// Discount or premium relative to the competitive landscape.
///
/// Priced well above the peer average, we compensate with an inbound
/// discount proportional to the gap; priced well below, a small premium
/// is sustainable.
pub fn competitive_fee(own_outbound_ppm: u32, peer_fee_rates: &[u32]) -> i32 {
    if peer_fee_rates.is_empty() {
        return 0;
    }
    let avg = peer_fee_rates.iter().map(|&r| r as f64).sum::<f64>() / peer_fee_rates.len() as f64;
    let own = own_outbound_ppm as f64;

    if own > avg * 1.5 {
        -((own - avg) * 0.3) as i32
    } else if own < avg * 0.7 {
        ((avg - own) * 0.2) as i32
    } else {
        0
    }
}
