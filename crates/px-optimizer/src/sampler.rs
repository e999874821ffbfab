//! Sampling strategies that turn a parameter domain into a concrete value.

use indexmap::IndexMap;
use px_types::{FrozenTrial, ParamValue, PxError, PxResult, SearchSpaceError, TrialState};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

/// A samplable parameter domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Distribution {
    Categorical { choices: Vec<Value> },
    /// Inclusive integer range on a `step` lattice anchored at `low`.
    Int { low: i64, high: i64, step: i64, log: bool },
    /// Inclusive float range, optionally on a `step` lattice.
    Float { low: f64, high: f64, step: Option<f64>, log: bool },
}

impl Distribution {
    /// Map a unit draw `u ∈ [0, 1)` onto the domain. The result always lies
    /// within the declared bounds.
    pub fn from_unit(&self, u: f64) -> ParamValue {
        let u = u.clamp(0.0, 1.0);
        match self {
            Self::Categorical { choices } => {
                let idx = ((u * choices.len() as f64) as usize).min(choices.len().saturating_sub(1));
                ParamValue::Json(choices.get(idx).cloned().unwrap_or(Value::Null))
            }
            Self::Int { low, high, step, log } => {
                if *log {
                    let (lo, hi) = ((*low as f64).ln(), (*high as f64 + 1.0).ln());
                    let v = (lo + u * (hi - lo)).exp().floor() as i64;
                    return ParamValue::Int(v.clamp(*low, *high));
                }
                // i128 keeps extreme i64 ranges from overflowing
                let (low, step) = (*low as i128, (*step).max(1) as i128);
                let slots = (*high as i128 - low) / step + 1;
                let k = ((u * slots as f64) as i128).min(slots - 1);
                ParamValue::Int((low + k * step) as i64)
            }
            Self::Float { low, high, step, log } => {
                if *log {
                    let (lo, hi) = (low.ln(), high.ln());
                    return ParamValue::Float((lo + u * (hi - lo)).exp().clamp(*low, *high));
                }
                match step {
                    Some(step) => {
                        let slots = ((high - low) / step).floor();
                        let k = (u * slots).round();
                        ParamValue::Float((low + k * step).min(*high))
                    }
                    None => ParamValue::Float((low + u * (high - low)).clamp(*low, *high)),
                }
            }
        }
    }

    /// Whether `value` lies inside the domain.
    pub fn contains(&self, value: &ParamValue) -> bool {
        match self {
            Self::Categorical { choices } => choices.contains(&value.to_json()),
            Self::Int { low, high, .. } => value.as_i64().is_some_and(|v| v >= *low && v <= *high),
            Self::Float { low, high, .. } => value.as_f64().is_some_and(|v| v >= *low && v <= *high),
        }
    }
}

/// What a sampler may look at when drawing one value.
#[derive(Debug, Clone, Copy)]
pub struct SampleContext<'a> {
    pub trial_number: u64,
    /// Position of this parameter among those already drawn for the trial.
    pub dimension: usize,
    /// Trials of the study at the time the trial was claimed.
    pub history: &'a [FrozenTrial],
}

/// Common trait for all samplers.
pub trait Sampler: Send {
    /// Draw a value for `name` from `distribution`.
    fn sample(
        &mut self,
        ctx: &SampleContext<'_>,
        name: &str,
        distribution: &Distribution,
    ) -> Result<ParamValue, SearchSpaceError>;

    /// Whether [`SampleContext::history`] must be populated.
    fn wants_history(&self) -> bool {
        false
    }

    /// Human-readable sampler name.
    fn name(&self) -> &str;
}

/// Seed for one (trial, parameter) stream, independent of which worker draws it.
fn stream_seed(seed: u64, trial_number: u64, name: &str) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in name.bytes() {
        h ^= u64::from(byte);
        h = h.wrapping_mul(0x0100_0000_01b3);
    }
    let mut z = seed ^ trial_number.wrapping_mul(0x9e37_79b9_7f4a_7c15) ^ h;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

// ---- Random ----

/// Independent uniform sampling across the domain.
#[derive(Debug, Clone)]
pub struct RandomSampler {
    seed: u64,
}

impl RandomSampler {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    fn unit(&self, trial_number: u64, name: &str) -> f64 {
        StdRng::seed_from_u64(stream_seed(self.seed, trial_number, name)).random::<f64>()
    }
}

impl Sampler for RandomSampler {
    fn sample(
        &mut self,
        ctx: &SampleContext<'_>,
        name: &str,
        distribution: &Distribution,
    ) -> Result<ParamValue, SearchSpaceError> {
        Ok(distribution.from_unit(self.unit(ctx.trial_number, name)))
    }

    fn name(&self) -> &str {
        "random"
    }
}

// ---- Grid ----

/// Exhaustive grid over explicitly listed values.
///
/// Trial `n` evaluates combination `n mod grid_size`, so workers that draw
/// distinct trial numbers cover distinct grid points.
#[derive(Debug, Clone)]
pub struct GridSampler {
    grid: IndexMap<String, Vec<Value>>,
    size: usize,
}

impl GridSampler {
    pub fn new(grid: IndexMap<String, Vec<Value>>) -> PxResult<Self> {
        if grid.is_empty() || grid.values().any(Vec::is_empty) {
            return Err(PxError::Config(
                "Grid sampler requires optimizer.grid_params with a non-empty list per parameter."
                    .to_string(),
            ));
        }
        let size = grid
            .values()
            .try_fold(1usize, |acc, values| acc.checked_mul(values.len()))
            .ok_or_else(|| PxError::Config("Grid sampler has too many grid points.".to_string()))?;
        Ok(Self { grid, size })
    }

    /// Total number of grid points.
    pub fn grid_size(&self) -> usize {
        self.size
    }
}

impl Sampler for GridSampler {
    fn sample(
        &mut self,
        ctx: &SampleContext<'_>,
        name: &str,
        _distribution: &Distribution,
    ) -> Result<ParamValue, SearchSpaceError> {
        let mut index = ctx.trial_number as usize % self.grid_size();
        for (key, values) in &self.grid {
            let digit = index % values.len();
            index /= values.len();
            if key == name {
                return Ok(ParamValue::Json(values[digit].clone()));
            }
        }
        Err(SearchSpaceError::Unsampleable {
            name: name.to_string(),
            message: "parameter is missing from grid_params".to_string(),
        })
    }

    fn name(&self) -> &str {
        "grid"
    }
}

// ---- Bayesian (explore / exploit) ----

/// Adaptive sampling biased toward the best completed trial.
///
/// With probability `exploration_weight`, or while there is no completed
/// trial to learn from, a trial is sampled at random. Otherwise every
/// parameter is a perturbation of the best trial's value, clamped to its
/// domain.
#[derive(Debug, Clone)]
pub struct BayesianSampler {
    seed: u64,
    exploration_weight: f64,
    random: RandomSampler,
}

impl BayesianSampler {
    pub fn new(seed: u64, exploration_weight: f64) -> Self {
        Self {
            seed,
            exploration_weight: exploration_weight.clamp(0.0, 1.0),
            random: RandomSampler::new(seed),
        }
    }

    fn best<'a>(history: &'a [FrozenTrial]) -> Option<&'a FrozenTrial> {
        history
            .iter()
            .filter(|t| t.state == TrialState::Complete)
            .filter_map(|t| t.value.map(|v| (t, v)))
            .fold(None, |best: Option<(&FrozenTrial, f64)>, (t, v)| match best {
                Some((_, bv)) if bv >= v => best,
                _ => Some((t, v)),
            })
            .map(|(t, _)| t)
    }

    fn explores(&self, trial_number: u64) -> bool {
        let mut rng = StdRng::seed_from_u64(stream_seed(self.seed, trial_number, ""));
        rng.random::<f64>() < self.exploration_weight
    }

    fn perturb(
        rng: &mut StdRng,
        base: &ParamValue,
        distribution: &Distribution,
    ) -> Option<ParamValue> {
        let value = match distribution {
            Distribution::Float { low, high, step, log } => {
                let v = base.as_f64()?;
                let raw = if *log && v > 0.0 {
                    let noise = rng.random_range(-0.1..0.1) * (high.ln() - low.ln());
                    (v.ln() + noise).exp()
                } else {
                    v + rng.random_range(-0.1..0.1) * (high - low)
                };
                let snapped = match step {
                    Some(s) => low + ((raw - low) / s).round() * s,
                    None => raw,
                };
                ParamValue::Float(snapped.clamp(*low, *high))
            }
            Distribution::Int { low, high, step, .. } => {
                let (low, high, step) = (*low as i128, *high as i128, (*step).max(1) as i128);
                let delta: i128 = rng.random_range(-2..=2);
                let moved = (base.as_i64()? as i128 + delta * step).clamp(low, high);
                // Back onto the low + k * step lattice, never above high
                ParamValue::Int((low + (moved - low) / step * step) as i64)
            }
            Distribution::Categorical { .. } => return None,
        };
        Some(value)
    }
}

impl Sampler for BayesianSampler {
    fn sample(
        &mut self,
        ctx: &SampleContext<'_>,
        name: &str,
        distribution: &Distribution,
    ) -> Result<ParamValue, SearchSpaceError> {
        if self.explores(ctx.trial_number) {
            return self.random.sample(ctx, name, distribution);
        }
        let base = Self::best(ctx.history).and_then(|t| t.params.get(name));
        let mut rng = StdRng::seed_from_u64(stream_seed(self.seed ^ 0x5bd1, ctx.trial_number, name));
        match base.and_then(|b| Self::perturb(&mut rng, b, distribution)) {
            Some(value) => Ok(value),
            // Fall back to random for choices or missing base
            None => self.random.sample(ctx, name, distribution),
        }
    }

    fn wants_history(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "bayesian"
    }
}

// ---- Quasi-random ----

const PRIMES: [u64; 16] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53];

/// Low-discrepancy sampling from a shifted Halton sequence.
#[derive(Debug, Clone)]
pub struct QmcSampler {
    seed: u64,
}

impl QmcSampler {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    fn radical_inverse(mut index: u64, base: u64) -> f64 {
        let mut result = 0.0;
        let mut f = 1.0 / base as f64;
        while index > 0 {
            result += f * (index % base) as f64;
            index /= base;
            f /= base as f64;
        }
        result
    }
}

impl Sampler for QmcSampler {
    fn sample(
        &mut self,
        ctx: &SampleContext<'_>,
        _name: &str,
        distribution: &Distribution,
    ) -> Result<ParamValue, SearchSpaceError> {
        let base = PRIMES[ctx.dimension % PRIMES.len()];
        let shift = StdRng::seed_from_u64(stream_seed(self.seed, ctx.dimension as u64, "qmc"))
            .random::<f64>();
        let u = (Self::radical_inverse(ctx.trial_number + 1, base) + shift).fract();
        Ok(distribution.from_unit(u))
    }

    fn name(&self) -> &str {
        "qmc"
    }
}

// ---- Configuration ----

/// Which sampler a study uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplerKind {
    Grid,
    Random,
    Bayesian,
    Qmc,
}

impl FromStr for SamplerKind {
    type Err = PxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "grid" => Ok(Self::Grid),
            "random" => Ok(Self::Random),
            "bayesian" | "tpe" => Ok(Self::Bayesian),
            "qmc" => Ok(Self::Qmc),
            other => Err(PxError::Config(format!(
                "Unsupported sampler '{other}'. Choose from grid/random/bayesian/qmc."
            ))),
        }
    }
}

/// Everything needed to rebuild the same sampler in every worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    pub kind: SamplerKind,
    pub seed: u64,
    #[serde(default)]
    pub grid_params: Option<IndexMap<String, Vec<Value>>>,
    pub exploration_weight: f64,
}

impl SamplerConfig {
    pub fn build(&self) -> PxResult<Box<dyn Sampler>> {
        Ok(match self.kind {
            SamplerKind::Grid => Box::new(GridSampler::new(
                self.grid_params.clone().unwrap_or_default(),
            )?),
            SamplerKind::Random => Box::new(RandomSampler::new(self.seed)),
            SamplerKind::Bayesian => {
                Box::new(BayesianSampler::new(self.seed, self.exploration_weight))
            }
            SamplerKind::Qmc => Box::new(QmcSampler::new(self.seed)),
        })
    }

    /// Number of grid points for a grid sampler.
    pub fn grid_size(&self) -> PxResult<Option<usize>> {
        match self.kind {
            SamplerKind::Grid => Ok(Some(
                GridSampler::new(self.grid_params.clone().unwrap_or_default())?.grid_size(),
            )),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use px_types::Params;
    use serde_json::json;

    fn ctx(trial_number: u64) -> SampleContext<'static> {
        SampleContext {
            trial_number,
            dimension: 0,
            history: &[],
        }
    }

    fn completed(number: u64, x: f64, value: f64) -> FrozenTrial {
        let mut trial = FrozenTrial::claimed(number, "w0");
        trial.state = TrialState::Complete;
        trial.value = Some(value);
        let mut params = Params::new();
        params.insert("x".into(), ParamValue::Float(x));
        trial.params = params;
        trial
    }

    #[test]
    fn random_sampler_is_reproducible_per_trial() {
        let dist = Distribution::Float { low: 0.0, high: 1.0, step: None, log: false };
        let mut a = RandomSampler::new(42);
        let mut b = RandomSampler::new(42);
        assert_eq!(
            a.sample(&ctx(3), "x", &dist).unwrap(),
            b.sample(&ctx(3), "x", &dist).unwrap()
        );
        assert_ne!(
            a.sample(&ctx(3), "x", &dist).unwrap(),
            a.sample(&ctx(4), "x", &dist).unwrap()
        );
    }

    #[test]
    fn grid_sampler_walks_every_combination() {
        let mut grid = IndexMap::new();
        grid.insert("a".to_string(), vec![json!(1), json!(2), json!(3)]);
        grid.insert("b".to_string(), vec![json!("x"), json!("y")]);
        let mut sampler = GridSampler::new(grid).unwrap();
        assert_eq!(sampler.grid_size(), 6);

        let dist = Distribution::Categorical { choices: vec![] };
        let mut seen = std::collections::HashSet::new();
        for n in 0..6 {
            let a = sampler.sample(&ctx(n), "a", &dist).unwrap();
            let b = sampler.sample(&ctx(n), "b", &dist).unwrap();
            seen.insert(format!("{a}-{b}"));
        }
        assert_eq!(seen.len(), 6);
        assert!(matches!(
            sampler.sample(&ctx(0), "c", &dist),
            Err(SearchSpaceError::Unsampleable { .. })
        ));
    }

    #[test]
    fn grid_sampler_requires_values() {
        assert!(GridSampler::new(IndexMap::new()).is_err());
        let mut grid = IndexMap::new();
        grid.insert("a".to_string(), vec![]);
        assert!(GridSampler::new(grid).is_err());
    }

    #[test]
    fn bayesian_sampler_starts_with_exploration() {
        let dist = Distribution::Float { low: 0.0, high: 1.0, step: None, log: false };
        let mut sampler = BayesianSampler::new(7, 0.0);
        let random = RandomSampler::new(7).sample(&ctx(0), "x", &dist).unwrap();
        // No history: exploit has nothing to perturb
        assert_eq!(sampler.sample(&ctx(0), "x", &dist).unwrap(), random);
    }

    #[test]
    fn bayesian_sampler_exploits_after_completions() {
        let dist = Distribution::Float { low: 0.0, high: 10.0, step: None, log: false };
        let history = vec![completed(0, 2.0, 0.1), completed(1, 8.0, 0.9), completed(2, 5.0, 0.5)];
        let mut sampler = BayesianSampler::new(11, 0.0);

        for n in 3..23 {
            let ctx = SampleContext { trial_number: n, dimension: 0, history: &history };
            let v = sampler.sample(&ctx, "x", &dist).unwrap().as_f64().unwrap();
            // Within ±10% of the range around the best point
            assert!((7.0..=9.0).contains(&v), "x = {v}");
        }
    }

    #[test]
    fn qmc_sampler_spreads_values() {
        let dist = Distribution::Float { low: 0.0, high: 1.0, step: None, log: false };
        let mut sampler = QmcSampler::new(0);
        let mut values: Vec<f64> = (0..16)
            .map(|n| sampler.sample(&ctx(n), "x", &dist).unwrap().as_f64().unwrap())
            .collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        // Every eighth of the interval gets at least one point
        for bucket in 0..8 {
            let lo = bucket as f64 / 8.0;
            assert!(values.iter().any(|v| *v >= lo && *v < lo + 0.125), "empty bucket {bucket}");
        }
    }

    #[test]
    fn sampler_kind_parsing() {
        assert_eq!("TPE".parse::<SamplerKind>().unwrap(), SamplerKind::Bayesian);
        assert_eq!("qmc".parse::<SamplerKind>().unwrap(), SamplerKind::Qmc);
        let err = "cmaes".parse::<SamplerKind>().unwrap_err();
        assert!(err.to_string().contains("Unsupported sampler 'cmaes'"));
    }

    #[test]
    fn stepped_domains_land_on_lattice() {
        let int = Distribution::Int { low: 1, high: 10, step: 3, log: false };
        for i in 0..20 {
            let v = int.from_unit(i as f64 / 20.0).as_i64().unwrap();
            assert!([1, 4, 7, 10].contains(&v), "v = {v}");
        }
        let float = Distribution::Float { low: 0.0, high: 1.0, step: Some(0.25), log: false };
        for i in 0..20 {
            let v = float.from_unit(i as f64 / 20.0).as_f64().unwrap();
            assert_eq!((v * 4.0).fract(), 0.0, "v = {v}");
        }
    }

    #[test]
    fn extreme_int_ranges_do_not_overflow() {
        let full = Distribution::Int { low: i64::MIN, high: i64::MAX, step: 1, log: false };
        assert_eq!(full.from_unit(0.0), ParamValue::Int(i64::MIN));
        for u in [0.25, 0.5, 0.999_999, 1.0] {
            assert!(full.contains(&full.from_unit(u)), "u = {u}");
        }
        let log = Distribution::Int { low: 1, high: i64::MAX, step: 1, log: true };
        assert!(log.contains(&log.from_unit(1.0)));
    }

    #[test]
    fn bayesian_int_moves_stay_on_lattice() {
        let dist = Distribution::Int { low: 1, high: 11, step: 3, log: false };
        let mut best = completed(0, 0.0, 1.0);
        best.params.insert("x".into(), ParamValue::Int(10));
        let history = vec![best];
        let mut sampler = BayesianSampler::new(3, 0.0);

        for n in 1..40 {
            let ctx = SampleContext { trial_number: n, dimension: 0, history: &history };
            let v = sampler.sample(&ctx, "x", &dist).unwrap().as_i64().unwrap();
            assert!([1, 4, 7, 10].contains(&v), "x = {v}");
        }
    }

    #[test]
    fn oversized_grid_is_rejected() {
        let values: Vec<Value> = (0..8192).map(|i| json!(i)).collect();
        let grid: IndexMap<String, Vec<Value>> =
            (0..5).map(|i| (format!("p{i}"), values.clone())).collect();
        assert!(matches!(GridSampler::new(grid), Err(PxError::Config(_))));
    }

    fn range_distribution() -> impl Strategy<Value = Distribution> {
        prop_oneof![
            (-1000i64..1000, 1i64..500, 1i64..7).prop_map(|(low, width, step)| Distribution::Int {
                low,
                high: low + width,
                step,
                log: false
            }),
            (1i64..1000, 1i64..5000).prop_map(|(low, width)| Distribution::Int {
                low,
                high: low + width,
                step: 1,
                log: true
            }),
            (-1.0e6..1.0e6f64, 1.0e-3..1.0e6f64).prop_map(|(low, width)| Distribution::Float {
                low,
                high: low + width,
                step: None,
                log: false
            }),
            (1.0e-6..10.0f64, 1.0..1.0e4f64).prop_map(|(low, scale)| Distribution::Float {
                low,
                high: low * (1.0 + scale),
                step: None,
                log: true
            }),
            (-100.0..100.0f64, 1.0..100.0f64, 0.01..5.0f64).prop_map(|(low, width, step)| {
                Distribution::Float { low, high: low + width, step: Some(step), log: false }
            }),
        ]
    }

    proptest! {
        #[test]
        fn every_sampler_stays_within_bounds(
            dist in range_distribution(),
            trial_number in 0u64..10_000,
            seed in any::<u64>(),
        ) {
            let history = vec![completed(0, 1.0, 1.0)];
            let ctx = SampleContext { trial_number, dimension: 1, history: &history };
            let mut samplers: Vec<Box<dyn Sampler>> = vec![
                Box::new(RandomSampler::new(seed)),
                Box::new(BayesianSampler::new(seed, 0.0)),
                Box::new(QmcSampler::new(seed)),
            ];
            for sampler in samplers.iter_mut() {
                let value = sampler.sample(&ctx, "x", &dist).unwrap();
                prop_assert!(dist.contains(&value), "{} produced {value} outside {dist:?}", sampler.name());
            }
        }
    }
}
