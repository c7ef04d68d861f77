use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use candle_transformers::models::llama;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::family::ModelFamily;
use super::sampling::{argmax, LogitsSampler, SamplingStrategy, TokenSampler};
use super::tokenizer::ModelTokenizer;
use crate::error::{EngineError, Result};
use crate::types::{ClassificationResult, ConversationState, GenerationOutput, GenerationParameters};

/// Total token budget of a dialogue, history included.
pub const CONVERSATION_MAX_LENGTH: usize = 1000;

enum CacheSlots {
    Layers(Vec<Option<(Tensor, Tensor)>>),
    Llama(Box<llama::Cache>),
}

/// Key/value state for one sequence being decoded: either per-layer tensors
/// owned here or the cache a candle model keeps for itself.
pub struct KvCache {
    slots: CacheSlots,
    seen_tokens: usize,
}

impl KvCache {
    pub fn new(num_layers: usize) -> Self {
        Self {
            slots: CacheSlots::Layers(vec![None; num_layers]),
            seen_tokens: 0,
        }
    }

    pub(crate) fn for_llama(cache: llama::Cache) -> Self {
        Self {
            slots: CacheSlots::Llama(Box::new(cache)),
            seen_tokens: 0,
        }
    }

    /// Number of positions already fed through the model.
    pub fn seen_tokens(&self) -> usize {
        self.seen_tokens
    }

    /// Layers held as explicit tensors; zero for a model-owned cache.
    pub fn num_layers(&self) -> usize {
        match &self.slots {
            CacheSlots::Layers(layers) => layers.len(),
            CacheSlots::Llama(_) => 0,
        }
    }

    pub(crate) fn layers_mut(&mut self) -> &mut [Option<(Tensor, Tensor)>] {
        match &mut self.slots {
            CacheSlots::Layers(layers) => layers,
            CacheSlots::Llama(_) => &mut [],
        }
    }

    pub(crate) fn llama_mut(&mut self) -> Option<&mut llama::Cache> {
        match &mut self.slots {
            CacheSlots::Llama(cache) => Some(cache.as_mut()),
            CacheSlots::Layers(_) => None,
        }
    }

    pub(crate) fn advance(&mut self, tokens: usize) {
        self.seen_tokens += tokens;
    }
}

impl std::fmt::Debug for KvCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.slots {
            CacheSlots::Layers(_) => "layers",
            CacheSlots::Llama(_) => "llama",
        };
        f.debug_struct("KvCache")
            .field("kind", &kind)
            .field("num_layers", &self.num_layers())
            .field("seen_tokens", &self.seen_tokens)
            .finish()
    }
}

/// Builds the sampler a single generation call draws tokens with.
pub type SamplerFactory = Arc<dyn Fn(SamplingStrategy) -> Box<dyn TokenSampler> + Send + Sync>;

fn entropy_sampler(strategy: SamplingStrategy) -> Box<dyn TokenSampler> {
    Box::new(LogitsSampler::from_entropy(strategy))
}

/// A decoder-only language model driven one step at a time.
pub trait CausalLm: Send + Sync {
    /// Feed `input_ids` of shape `(1, seq)` after everything already in
    /// `cache`. `attention_mask` covers cached plus new positions. Returns the
    /// f32 logits of the last position, shape `(1, vocab)`.
    fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        cache: &mut KvCache,
    ) -> candle_core::Result<Tensor>;

    fn new_cache(&self) -> candle_core::Result<KvCache>;

    fn max_positions(&self) -> usize;

    fn device(&self) -> &Device;
}

/// An encoder with a classification head.
pub trait SequenceClassifier: Send + Sync {
    /// Class logits for `input_ids` of shape `(1, seq)`, shape `(num_labels,)`.
    fn logits(&self, input_ids: &Tensor) -> candle_core::Result<Tensor>;

    fn max_positions(&self) -> usize;

    fn device(&self) -> &Device;
}

pub struct ClassifierRuntime {
    model: Arc<dyn SequenceClassifier>,
    tokenizer: ModelTokenizer,
    labels: Vec<String>,
}

impl ClassifierRuntime {
    pub fn new(model: Arc<dyn SequenceClassifier>, tokenizer: ModelTokenizer, labels: Vec<String>) -> Self {
        Self {
            model,
            tokenizer,
            labels,
        }
    }

    /// Human-readable label names by class index, when the config has them.
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Arg-max class for `text`; ties go to the lowest index.
    pub fn classify(&self, text: &str) -> Result<ClassificationResult> {
        let mut ids = self.tokenizer.encode(text, true)?;
        if ids.is_empty() {
            return Err(EngineError::validation("text", "input encodes to no tokens"));
        }
        ids.truncate(self.model.max_positions());

        let input = Tensor::new(ids.as_slice(), self.model.device())?.unsqueeze(0)?;
        let logits = self
            .model
            .logits(&input)?
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()?;
        let class = argmax(&logits).ok_or_else(|| EngineError::inference("classifier produced no logits"))?;

        debug!(
            class,
            label = self.labels.get(class).map(String::as_str).unwrap_or("?"),
            tokens = ids.len(),
            "Classified input"
        );
        Ok(class)
    }
}

pub struct GeneratorRuntime {
    model: Arc<dyn CausalLm>,
    tokenizer: ModelTokenizer,
    family: ModelFamily,
    new_sampler: SamplerFactory,
}

impl GeneratorRuntime {
    pub fn new(model: Arc<dyn CausalLm>, tokenizer: ModelTokenizer, family: ModelFamily) -> Self {
        Self {
            model,
            tokenizer,
            family,
            new_sampler: Arc::new(entropy_sampler),
        }
    }

    /// Replace the entropy-seeded sampler used by [`GeneratorRuntime::generate`].
    pub fn with_sampler_factory(mut self, factory: SamplerFactory) -> Self {
        self.new_sampler = factory;
        self
    }

    pub fn family(&self) -> ModelFamily {
        self.family
    }

    /// Generate a reply to `text`. Conversational models decode greedily and
    /// return the updated dialogue state; other decoders sample a single
    /// completion from `params`.
    pub fn generate(
        &self,
        text: &str,
        params: &GenerationParameters,
        state: Option<ConversationState>,
        cancel: &CancellationToken,
    ) -> Result<GenerationOutput> {
        let mut sampler = (self.new_sampler)(SamplingStrategy::for_family(self.family, params));
        self.generate_with_sampler(text, params, state, sampler.as_mut(), cancel)
    }

    /// Same as [`GeneratorRuntime::generate`] with a caller-supplied sampler.
    pub fn generate_with_sampler(
        &self,
        text: &str,
        params: &GenerationParameters,
        state: Option<ConversationState>,
        sampler: &mut dyn TokenSampler,
        cancel: &CancellationToken,
    ) -> Result<GenerationOutput> {
        match self.family {
            ModelFamily::Conversational => self.respond(text, state, sampler, cancel),
            ModelFamily::CausalGeneration => {
                if state.as_ref().is_some_and(|s| !s.is_empty()) {
                    debug!("Ignoring conversation state for a single-turn model");
                }
                self.complete(text, params.max_length, sampler, cancel)
            }
            ModelFamily::SequenceClassification => Err(EngineError::Generation {
                message: "a sequence classification model cannot generate text".to_string(),
                source: None,
            }),
        }
    }

    fn respond(
        &self,
        text: &str,
        state: Option<ConversationState>,
        sampler: &mut dyn TokenSampler,
        cancel: &CancellationToken,
    ) -> Result<GenerationOutput> {
        let turn = self.tokenizer.encode_turn(text)?;
        let mut input = match state {
            Some(state) => {
                self.check_state(&state)?;
                state.into_tokens()
            }
            None => Vec::with_capacity(turn.len()),
        };
        input.extend_from_slice(&turn);

        let output = decode_loop(
            self.model.as_ref(),
            &input,
            CONVERSATION_MAX_LENGTH,
            self.tokenizer.eos_token_id(),
            sampler,
            cancel,
        )?;
        let reply = self.tokenizer.decode(&output[input.len()..], true)?;

        debug!(
            history = input.len() - turn.len(),
            reply_tokens = output.len() - input.len(),
            "Generated conversational reply"
        );
        Ok(GenerationOutput {
            text: reply,
            state: Some(ConversationState::new(output)),
        })
    }

    fn complete(
        &self,
        text: &str,
        max_length: usize,
        sampler: &mut dyn TokenSampler,
        cancel: &CancellationToken,
    ) -> Result<GenerationOutput> {
        let prompt = self.tokenizer.encode(text, true)?;
        if prompt.len() >= max_length {
            return Err(EngineError::validation(
                "max_length",
                format!(
                    "prompt encodes to {} tokens, leaving no room under max_length {max_length}",
                    prompt.len()
                ),
            ));
        }
        let output = decode_loop(
            self.model.as_ref(),
            &prompt,
            max_length,
            self.tokenizer.eos_token_id(),
            sampler,
            cancel,
        )?;

        debug!(
            prompt_tokens = prompt.len(),
            new_tokens = output.len() - prompt.len(),
            pad_token = ?self.tokenizer.pad_or_eos(),
            "Generated completion"
        );
        Ok(GenerationOutput {
            text: self.tokenizer.decode(&output, true)?,
            state: None,
        })
    }

    fn check_state(&self, state: &ConversationState) -> Result<()> {
        let vocab = self.tokenizer.vocab_size();
        match state.tokens().iter().find(|&&id| id as usize >= vocab) {
            Some(id) => Err(EngineError::validation(
                "chat_history_ids",
                format!("token id {id} is outside the vocabulary of {vocab}"),
            )),
            None => Ok(()),
        }
    }
}

/// Autoregressive decoding of a single sequence. Stops once the whole
/// sequence holds `max_length` tokens (capped by the model's position
/// budget) or `eos` is produced. A prompt already at the limit comes back
/// unchanged; single-turn callers reject such prompts up front.
pub(crate) fn decode_loop(
    lm: &dyn CausalLm,
    prompt: &[u32],
    max_length: usize,
    eos: Option<u32>,
    sampler: &mut dyn TokenSampler,
    cancel: &CancellationToken,
) -> Result<Vec<u32>> {
    if prompt.is_empty() {
        return Err(EngineError::validation("text", "input encodes to no tokens"));
    }
    let limit = max_length.min(lm.max_positions());
    let mut tokens = prompt.to_vec();
    if tokens.len() >= limit {
        return Ok(tokens);
    }

    let device = lm.device();
    let mut cache = lm.new_cache()?;
    let mut step_input = Tensor::new(prompt, device)?.unsqueeze(0)?;

    while tokens.len() < limit {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let attention_mask = Tensor::ones((1, tokens.len()), DType::U32, device)?;
        let logits = lm.forward(&step_input, &attention_mask, &mut cache)?.squeeze(0)?;

        let next = sampler.sample(&logits)?;
        tokens.push(next);
        if Some(next) == eos {
            break;
        }
        step_input = Tensor::new(&[next], device)?.unsqueeze(0)?;
    }
    Ok(tokens)
}
