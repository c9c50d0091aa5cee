//! Reputation-discounted gas pricing (spec.md §4.9).
//!
//! Grounded on `examples/original_source/src/cvm/fee_calculator.cpp`: the
//! six-band reputation discount table, the `gas · price / 1e10` satoshi
//! conversion with a 1-satoshi floor for nonzero amounts, the free-gas
//! daily-allowance gate at reputation ≥ 80, and network-load-scaled
//! predictable pricing (`SustainableGasSystem::GetPredictableGasPrice`,
//! whose concrete congestion curve the source does not carry into this
//! pack — reconstructed here from the stated contract: load 0 always
//! returns the base price).

use std::collections::HashMap;

use crypto_primitives::{Addr, Amount};
use serde::{Deserialize, Serialize};

/// 1e10, the wei-per-satoshi conversion factor (spec.md §9 open question:
/// whether this should become a governance parameter).
pub const GAS_TO_SATOSHI_DIVISOR: u128 = 10_000_000_000;

pub const DEFAULT_BASE_GAS_PRICE: u64 = 10_000_000;
pub const FREE_GAS_REPUTATION_THRESHOLD: i16 = 80;
pub const DEFAULT_DAILY_FREE_GAS_ALLOWANCE: u64 = 1_000_000;
pub const SECS_PER_DAY: i64 = 86_400;

/// `gas · price / 1e10`, never less than 1 satoshi for a nonzero product.
pub fn gas_to_satoshis(gas: u64, gas_price: u64) -> Amount {
    let total = gas as u128 * gas_price as u128;
    if total == 0 {
        return 0;
    }
    let satoshis = total / GAS_TO_SATOSHI_DIVISOR;
    satoshis.max(1) as Amount
}

pub fn satoshis_to_gas(satoshis: Amount, gas_price: u64) -> u64 {
    if gas_price == 0 || satoshis <= 0 {
        return 0;
    }
    let total_wei = satoshis as u128 * GAS_TO_SATOSHI_DIVISOR;
    (total_wei / gas_price as u128) as u64
}

/// Lower is better: 0.5x at reputation ≥ 90 down to 1.0x (no discount)
/// below 50, in bands of ten.
pub fn reputation_multiplier(reputation: i16) -> f64 {
    match reputation {
        r if r >= 90 => 0.5,
        r if r >= 80 => 0.6,
        r if r >= 70 => 0.7,
        r if r >= 60 => 0.8,
        r if r >= 50 => 0.9,
        _ => 1.0,
    }
}

pub fn reputation_discount(base_fee: Amount, reputation: i16) -> Amount {
    let multiplier = reputation_multiplier(reputation);
    (base_fee as f64 * (1.0 - multiplier)) as Amount
}

/// Congestion sensitivity: well-reputed senders see gentler price growth
/// under load (the "sustainable" part of `SustainableGasSystem`), while
/// zero load always resolves to the base price regardless of reputation.
fn congestion_multiplier(reputation: i16) -> f64 {
    match reputation {
        r if r >= 90 => 0.5,
        r if r >= 70 => 0.75,
        r if r >= 50 => 1.0,
        r if r >= 20 => 1.25,
        _ => 1.5,
    }
}

/// `base_price · (1 + load/100 · congestion_multiplier(reputation))`.
pub fn predictable_gas_price(reputation: i16, network_load_pct: u64, base_price: u64) -> u64 {
    if network_load_pct == 0 {
        return base_price;
    }
    let load = network_load_pct.min(100) as f64 / 100.0;
    let bump = base_price as f64 * load * congestion_multiplier(reputation);
    (base_price as f64 + bump) as u64
}

/// `0` at the base price, scaling toward 100 as price doubles, matching
/// the source's `priceRatio - 100, capped at 100` mapping.
pub fn network_load_from_price_ratio(current_price: u64, base_price: u64) -> u64 {
    if base_price == 0 {
        return 50;
    }
    let ratio = (current_price as u128 * 100) / base_price as u128;
    if ratio >= 100 {
        (ratio - 100).min(100) as u64
    } else {
        0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GasParams {
    pub base_gas_price: u64,
}

impl Default for GasParams {
    fn default() -> Self {
        Self { base_gas_price: DEFAULT_BASE_GAS_PRICE }
    }
}

/// Per-address daily free-gas usage, bucketed by day index (`ts /
/// SECS_PER_DAY`), matching `GasAllowanceTracker`'s daily reset.
#[derive(Debug, Clone, Copy, Default)]
struct AllowanceState {
    day: i64,
    used_today: u64,
}

#[derive(Default)]
pub struct GasAllowanceTracker {
    state: HashMap<Addr, AllowanceState>,
    daily_allowance: u64,
}

impl GasAllowanceTracker {
    pub fn new(daily_allowance: u64) -> Self {
        Self { state: HashMap::new(), daily_allowance }
    }

    fn day_of(ts: i64) -> i64 {
        ts / SECS_PER_DAY
    }

    pub fn remaining(&mut self, addr: Addr, now: i64) -> u64 {
        let day = Self::day_of(now);
        let entry = self.state.entry(addr).or_default();
        if entry.day != day {
            entry.day = day;
            entry.used_today = 0;
        }
        self.daily_allowance.saturating_sub(entry.used_today)
    }

    pub fn has_sufficient_allowance(&mut self, addr: Addr, gas: u64, now: i64) -> bool {
        self.remaining(addr, now) >= gas
    }

    pub fn consume(&mut self, addr: Addr, gas: u64, now: i64) {
        let day = Self::day_of(now);
        let entry = self.state.entry(addr).or_default();
        if entry.day != day {
            entry.day = day;
            entry.used_today = 0;
        }
        entry.used_today += gas;
    }
}

/// Per-address guaranteed gas price, valid until a stated block height.
#[derive(Debug, Clone, Copy)]
pub struct PriceGuarantee {
    pub price: u64,
    pub valid_until_height: i32,
}

#[derive(Default)]
pub struct PriceGuaranteeRegistry {
    guarantees: HashMap<Addr, PriceGuarantee>,
}

impl PriceGuaranteeRegistry {
    pub fn set(&mut self, addr: Addr, guarantee: PriceGuarantee) {
        self.guarantees.insert(addr, guarantee);
    }

    pub fn active(&self, addr: &Addr, current_height: i32) -> Option<PriceGuarantee> {
        self.guarantees.get(addr).filter(|g| g.valid_until_height >= current_height).copied()
    }
}

/// Gas subsidy for reputation ≥ 80 ("beneficial") operations, capped at a
/// configured fraction of the gas used.
#[derive(Default)]
pub struct GasSubsidyTracker {
    pub subsidy_fraction: f64,
}

impl GasSubsidyTracker {
    pub fn new(subsidy_fraction: f64) -> Self {
        Self { subsidy_fraction }
    }

    pub fn calculate_subsidy_gas(&self, gas_used: u64, reputation: i16) -> u64 {
        if reputation < FREE_GAS_REPUTATION_THRESHOLD {
            return 0;
        }
        (gas_used as f64 * self.subsidy_fraction) as u64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FeeCalculationResult {
    pub gas_limit: u64,
    pub gas_price: u64,
    pub base_fee: Amount,
    pub reputation_discount: Amount,
    pub gas_subsidy: Amount,
    pub effective_fee: Amount,
    pub is_free_gas: bool,
    pub has_price_guarantee: bool,
    pub reputation: i16,
}

/// Ties the gas-pricing pipeline together: free-gas gate, price guarantee,
/// network-load-scaled predictable price, discount, subsidy.
pub struct FeeCalculator {
    pub params: GasParams,
    pub allowance: GasAllowanceTracker,
    pub guarantees: PriceGuaranteeRegistry,
    pub subsidies: GasSubsidyTracker,
}

impl Default for FeeCalculator {
    fn default() -> Self {
        Self {
            params: GasParams::default(),
            allowance: GasAllowanceTracker::new(DEFAULT_DAILY_FREE_GAS_ALLOWANCE),
            guarantees: PriceGuaranteeRegistry::default(),
            subsidies: GasSubsidyTracker::new(0.5),
        }
    }
}

impl FeeCalculator {
    pub fn new(daily_free_gas_allowance: u64, subsidy_fraction: f64) -> Self {
        Self {
            params: GasParams::default(),
            allowance: GasAllowanceTracker::new(daily_free_gas_allowance),
            guarantees: PriceGuaranteeRegistry::default(),
            subsidies: GasSubsidyTracker::new(subsidy_fraction),
        }
    }

    pub fn calculate_fee(
        &mut self,
        sender: Addr,
        gas_limit: u64,
        reputation: i16,
        network_load_pct: u64,
        current_height: i32,
        now: i64,
    ) -> FeeCalculationResult {
        let mut result = FeeCalculationResult { gas_limit, reputation, ..Default::default() };

        if reputation >= FREE_GAS_REPUTATION_THRESHOLD
            && self.allowance.has_sufficient_allowance(sender, gas_limit, now)
        {
            self.allowance.consume(sender, gas_limit, now);
            result.is_free_gas = true;
            return result;
        }

        let guarantee = self.guarantees.active(&sender, current_height);
        result.has_price_guarantee = guarantee.is_some();
        result.gas_price = match guarantee {
            Some(g) => g.price,
            None => predictable_gas_price(reputation, network_load_pct, self.params.base_gas_price),
        };

        result.base_fee = gas_to_satoshis(gas_limit, result.gas_price);
        result.reputation_discount = reputation_discount(result.base_fee, reputation);

        let subsidy_gas = self.subsidies.calculate_subsidy_gas(gas_limit, reputation);
        result.gas_subsidy = gas_to_satoshis(subsidy_gas, result.gas_price);

        let effective = result.base_fee - result.reputation_discount - result.gas_subsidy;
        result.effective_fee = effective.max(0);
        result
    }

    /// 10% of the base fee, with the reputation discount applied, floored
    /// at 1 satoshi — a spam floor for non-free-gas senders (spec.md §4.9,
    /// "fee_calculator.cpp's ... minimum fee is 10% of base fee").
    pub fn minimum_fee(&self, gas_limit: u64, reputation: i16, network_load_pct: u64) -> Amount {
        let price = predictable_gas_price(reputation, network_load_pct, self.params.base_gas_price);
        let base_fee = gas_to_satoshis(gas_limit, price);
        let min_fee = base_fee / 10;
        let discount = reputation_discount(min_fee, reputation);
        (min_fee - discount).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> Addr {
        let mut b = [0u8; 20];
        b[0] = n;
        Addr(b)
    }

    #[test]
    fn gas_to_satoshis_floors_at_one() {
        assert_eq!(gas_to_satoshis(1, 1), 1);
        assert_eq!(gas_to_satoshis(0, 1000), 0);
    }

    #[test]
    fn discount_bands_match_spec() {
        assert!((reputation_multiplier(95) - 0.5).abs() < 1e-9);
        assert!((reputation_multiplier(85) - 0.6).abs() < 1e-9);
        assert!((reputation_multiplier(75) - 0.7).abs() < 1e-9);
        assert!((reputation_multiplier(65) - 0.8).abs() < 1e-9);
        assert!((reputation_multiplier(55) - 0.9).abs() < 1e-9);
        assert!((reputation_multiplier(10) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn zero_load_returns_base_price_regardless_of_reputation() {
        assert_eq!(predictable_gas_price(85, 0, DEFAULT_BASE_GAS_PRICE), DEFAULT_BASE_GAS_PRICE);
        assert_eq!(predictable_gas_price(5, 0, DEFAULT_BASE_GAS_PRICE), DEFAULT_BASE_GAS_PRICE);
    }

    /// Scenario 5 (spec.md §8): rep=85, gasLimit=50000, load=0.
    #[test]
    fn scenario_gas_pricing_free_gas_path() {
        let mut calc = FeeCalculator::default();
        let sender = addr(1);
        let result = calc.calculate_fee(sender, 50_000, 85, 0, 100, 0);
        assert!(result.is_free_gas);
        assert_eq!(result.effective_fee, 0);
    }

    #[test]
    fn scenario_gas_pricing_paid_path_when_allowance_exhausted() {
        let mut calc = FeeCalculator::new(10_000, 0.5);
        let sender = addr(2);
        let result = calc.calculate_fee(sender, 50_000, 85, 0, 100, 0);
        assert!(!result.is_free_gas);
        let expected_base = gas_to_satoshis(50_000, DEFAULT_BASE_GAS_PRICE);
        assert_eq!(result.base_fee, expected_base);
        let expected_discount = reputation_discount(expected_base, 85);
        assert_eq!(result.reputation_discount, expected_discount);
    }

    #[test]
    fn allowance_resets_on_new_day() {
        let mut tracker = GasAllowanceTracker::new(100);
        let a = addr(3);
        tracker.consume(a, 100, 0);
        assert!(!tracker.has_sufficient_allowance(a, 1, 0));
        assert!(tracker.has_sufficient_allowance(a, 1, SECS_PER_DAY));
    }

    #[test]
    fn price_guarantee_overrides_predictable_price() {
        let mut calc = FeeCalculator::new(0, 0.0);
        let sender = addr(4);
        calc.guarantees.set(sender, PriceGuarantee { price: 42, valid_until_height: 1000 });
        let result = calc.calculate_fee(sender, 1000, 30, 50, 100, 0);
        assert!(result.has_price_guarantee);
        assert_eq!(result.gas_price, 42);
    }

    #[test]
    fn effective_fee_never_negative() {
        let mut calc = FeeCalculator::new(0, 1.0);
        let sender = addr(5);
        let result = calc.calculate_fee(sender, 1000, 95, 0, 100, 0);
        assert!(result.effective_fee >= 0);
    }
}
