//! Llama-family decoder for the single-turn generation path, backed by
//! candle's implementation and its own rotary/kv cache.

use candle_core::{bail, DType, Device, Result, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::llama::{Cache, Config, Llama, LlamaConfig};

use super::runtime::{CausalLm, KvCache};

pub struct LlamaDecoder {
    model: Llama,
    config: Config,
    dtype: DType,
    device: Device,
    span: tracing::Span,
}

impl LlamaDecoder {
    /// Build from the raw `config.json` text.
    pub fn load(vb: VarBuilder, config_json: &str) -> Result<Self> {
        let config: LlamaConfig = serde_json::from_str(config_json).map_err(candle_core::Error::wrap)?;
        let config = config.into_config(false);
        let model = Llama::load(vb.clone(), &config)?;

        Ok(Self {
            model,
            config,
            dtype: vb.dtype(),
            device: vb.device().clone(),
            span: tracing::span!(tracing::Level::TRACE, "llama"),
        })
    }
}

impl CausalLm for LlamaDecoder {
    fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor, cache: &mut KvCache) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (b_sz, seq_len) = input_ids.dims2()?;
        if b_sz != 1 {
            bail!("llama forward expects a single sequence, got batch of {b_sz}");
        }
        let offset = cache.seen_tokens();
        let (_, mask_len) = attention_mask.dims2()?;
        if mask_len != offset + seq_len {
            bail!(
                "attention mask covers {mask_len} positions, expected {}",
                offset + seq_len
            );
        }
        if offset + seq_len > self.config.max_position_embeddings {
            bail!(
                "sequence of {} tokens exceeds the {} positions this model supports",
                offset + seq_len,
                self.config.max_position_embeddings
            );
        }

        let Some(state) = cache.llama_mut() else {
            bail!("llama forward needs a cache created by the same model");
        };
        let logits = self.model.forward(input_ids, offset, state)?;
        cache.advance(seq_len);
        logits.to_dtype(DType::F32)
    }

    fn new_cache(&self) -> Result<KvCache> {
        Cache::new(true, self.dtype, &self.config, &self.device).map(KvCache::for_llama)
    }

    fn max_positions(&self) -> usize {
        self.config.max_position_embeddings
    }

    fn device(&self) -> &Device {
        &self.device
    }
}
