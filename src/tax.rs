/// A progressive bracket: income above `floor` pays `base` plus `rate` on the
/// excess over `floor`.
struct Bracket {
    floor: f64,
    base: f64,
    rate: f64,
}

// Ordered by floor. `base` is the tax owed on income exactly at `floor`.
const SCHEDULE: [Bracket; 4] = [
    Bracket { floor: 0.0, base: 0.0, rate: 0.0 },
    Bracket { floor: 250_000.0, base: 0.0, rate: 0.05 },
    Bracket { floor: 500_000.0, base: 12_500.0, rate: 0.20 },
    Bracket { floor: 1_000_000.0, base: 112_500.0, rate: 0.30 },
];

/// Tax owed on `income`. Total: zero, negative and NaN incomes owe nothing.
pub fn tax(income: f64) -> f64 {
    SCHEDULE
        .iter()
        .rev()
        .find(|b| income > b.floor)
        .map(|b| b.base + (income - b.floor) * b.rate)
        .unwrap_or(0.0)
}

pub fn net_income(income: f64) -> f64 {
    income - tax(income)
}
