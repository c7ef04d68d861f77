//! Next-token selection: greedy arg-max or temperature / top-k / top-p sampling.
//!
//! Drawing is delegated to candle's `LogitsProcessor`; this module only maps
//! generation parameters onto a `Sampling` configuration.

use candle_core::Tensor;
use candle_transformers::generation::{LogitsProcessor, Sampling};

use super::family::ModelFamily;
use crate::error::{EngineError, Result};
use crate::types::GenerationParameters;

/// Below this temperature the scaled logits overflow f32 and the sampling
/// distribution is a point mass on the arg-max anyway.
pub const MIN_SAMPLING_TEMPERATURE: f64 = 1e-7;

/// How the next token is chosen from a logits vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamplingStrategy {
    Greedy,
    Sample {
        temperature: f64,
        /// `None` disables top-k filtering.
        top_k: Option<usize>,
        /// `None` disables nucleus filtering.
        top_p: Option<f64>,
    },
}

impl SamplingStrategy {
    /// Sampling configuration for a descriptor's parameters. A `top_k` of 0
    /// and a `top_p` of 1.0 disable the corresponding filter.
    pub fn from_parameters(params: &GenerationParameters) -> Self {
        SamplingStrategy::Sample {
            temperature: params.temperature,
            top_k: (params.top_k > 0).then_some(params.top_k),
            top_p: (params.top_p < 1.0).then_some(params.top_p),
        }
    }

    /// Conversational models decode greedily; every other decoder samples
    /// with the descriptor's parameters.
    pub fn for_family(family: ModelFamily, params: &GenerationParameters) -> Self {
        match family {
            ModelFamily::Conversational => SamplingStrategy::Greedy,
            _ => SamplingStrategy::from_parameters(params),
        }
    }

    /// The candle sampling configuration this strategy runs as.
    pub fn sampling(&self) -> Sampling {
        match *self {
            SamplingStrategy::Greedy => Sampling::ArgMax,
            SamplingStrategy::Sample { temperature, .. } if temperature < MIN_SAMPLING_TEMPERATURE => {
                Sampling::ArgMax
            }
            SamplingStrategy::Sample {
                temperature,
                top_k,
                top_p,
            } => match (top_k, top_p) {
                (Some(k), Some(p)) => Sampling::TopKThenTopP { k, p, temperature },
                (Some(k), None) => Sampling::TopK { k, temperature },
                (None, Some(p)) => Sampling::TopP { p, temperature },
                (None, None) => Sampling::All { temperature },
            },
        }
    }
}

/// Picks the next token id from the logits of the last position.
pub trait TokenSampler: Send {
    /// `logits` has shape `(vocab,)`.
    fn sample(&mut self, logits: &Tensor) -> Result<u32>;
}

pub struct LogitsSampler {
    strategy: SamplingStrategy,
    processor: LogitsProcessor,
}

impl LogitsSampler {
    pub fn new(seed: u64, strategy: SamplingStrategy) -> Self {
        Self {
            strategy,
            processor: LogitsProcessor::from_sampling(seed, strategy.sampling()),
        }
    }

    pub fn from_entropy(strategy: SamplingStrategy) -> Self {
        Self::new(rand::random(), strategy)
    }

    pub fn strategy(&self) -> SamplingStrategy {
        self.strategy
    }
}

impl std::fmt::Debug for LogitsSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogitsSampler")
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

impl TokenSampler for LogitsSampler {
    fn sample(&mut self, logits: &Tensor) -> Result<u32> {
        if logits.elem_count() == 0 {
            return Err(EngineError::inference("cannot sample from empty logits"));
        }
        self.processor.sample(logits).map_err(|e| EngineError::Inference {
            message: format!("sampling failed: {e}"),
            source: Some(Box::new(e)),
        })
    }
}

/// Index of the largest value; ties resolve to the lowest index and NaN is
/// never selected.
pub fn argmax(values: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in values.iter().enumerate() {
        if v.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}
