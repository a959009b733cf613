use std::collections::BTreeMap;
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

pub const PRIMARY_CLOUD: &str = "primary-cloud";
pub const PRIMARY_LOCAL: &str = "primary-local";
pub const SUMMARIZER_CLOUD: &str = "summarizer-cloud";
pub const SUMMARIZER_LOCAL: &str = "summarizer-local";
pub const NEXT_STEP_CLOUD: &str = "next-step-cloud";
pub const NEXT_STEP_LOCAL: &str = "next-step-local";

const NANOS_PER_DOLLAR: f64 = 1e9;

/// What a model is being used for; combined with locality it names the
/// accounting category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelRole {
    Primary,
    Summarizer,
    NextStep,
}

impl ModelRole {
    pub fn category(&self, local: bool) -> &'static str {
        match (self, local) {
            (ModelRole::Primary, false) => PRIMARY_CLOUD,
            (ModelRole::Primary, true) => PRIMARY_LOCAL,
            (ModelRole::Summarizer, false) => SUMMARIZER_CLOUD,
            (ModelRole::Summarizer, true) => SUMMARIZER_LOCAL,
            (ModelRole::NextStep, false) => NEXT_STEP_CLOUD,
            (ModelRole::NextStep, true) => NEXT_STEP_LOCAL,
        }
    }
}

/// Dollar amount held as integer nanodollars so sums are exact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cost(u64);

impl Cost {
    pub const ZERO: Cost = Cost(0);

    pub fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub fn nanos(&self) -> u64 {
        self.0
    }

    pub fn as_dollars(&self) -> f64 {
        self.0 as f64 / NANOS_PER_DOLLAR
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl Add for Cost {
    type Output = Cost;

    fn add(self, rhs: Cost) -> Cost {
        Cost(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Cost {
    fn add_assign(&mut self, rhs: Cost) {
        *self = *self + rhs;
    }
}

impl Sum for Cost {
    fn sum<I: Iterator<Item = Cost>>(iter: I) -> Cost {
        iter.fold(Cost::ZERO, Add::add)
    }
}

impl fmt::Display for Cost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${:.6}", self.as_dollars())
    }
}

/// Per-1000-token dollar rates for one category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rates {
    #[serde(default)]
    pub input_per_1k: f64,
    #[serde(default)]
    pub output_per_1k: f64,
}

impl Rates {
    pub const FREE: Rates = Rates {
        input_per_1k: 0.0,
        output_per_1k: 0.0,
    };

    pub fn new(input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            input_per_1k,
            output_per_1k,
        }
    }

    /// `input * rate_in / 1000 + output * rate_out / 1000`
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> Cost {
        let input = input_tokens.saturating_mul(nanos_per_token(self.input_per_1k));
        let output = output_tokens.saturating_mul(nanos_per_token(self.output_per_1k));
        Cost(input.saturating_add(output))
    }
}

/// $/1k tokens to nanodollars per token. Negative or NaN rates price at zero.
fn nanos_per_token(rate_per_1k: f64) -> u64 {
    let nanos = (rate_per_1k * NANOS_PER_DOLLAR / 1000.0).round();
    if nanos.is_finite() && nanos > 0.0 {
        nanos as u64
    } else {
        0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PricingTable {
    rates: BTreeMap<String, Rates>,
}

impl Default for PricingTable {
    fn default() -> Self {
        let mut rates = BTreeMap::new();
        rates.insert(PRIMARY_CLOUD.to_string(), Rates::new(0.008, 0.024));
        rates.insert(SUMMARIZER_CLOUD.to_string(), Rates::new(0.0001, 0.0004));
        rates.insert(NEXT_STEP_CLOUD.to_string(), Rates::new(0.0001, 0.0004));
        rates.insert(PRIMARY_LOCAL.to_string(), Rates::FREE);
        rates.insert(SUMMARIZER_LOCAL.to_string(), Rates::FREE);
        rates.insert(NEXT_STEP_LOCAL.to_string(), Rates::FREE);
        Self { rates }
    }
}

impl PricingTable {
    pub fn empty() -> Self {
        Self {
            rates: BTreeMap::new(),
        }
    }

    pub fn with_rates(mut self, category: impl Into<String>, rates: Rates) -> Self {
        self.rates.insert(category.into(), rates);
        self
    }

    /// Overlay entries from another table, replacing same-named categories.
    pub fn merge(mut self, overrides: impl IntoIterator<Item = (String, Rates)>) -> Self {
        self.rates.extend(overrides);
        self
    }

    pub fn rates_for(&self, category: &str) -> Option<Rates> {
        self.rates.get(category).copied()
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.rates.keys().map(String::as_str)
    }
}
