//! GPT-2 decoder (also used for DialoGPT checkpoints) with an external KV cache.

use candle_core::{bail, DType, Device, IndexOp, Module, Result, Tensor, D};
use candle_nn::{embedding, layer_norm, Embedding, LayerNorm, Linear, VarBuilder};
use serde::Deserialize;

use super::runtime::{CausalLm, KvCache};

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

/// Fields read from a GPT-2 style `config.json`. Unknown keys are ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Gpt2Config {
    pub vocab_size: usize,
    pub n_positions: usize,
    pub n_embd: usize,
    pub n_layer: usize,
    pub n_head: usize,
    /// Width of the feed-forward layer, `4 * n_embd` when absent.
    #[serde(default)]
    pub n_inner: Option<usize>,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
    #[serde(default)]
    pub eos_token_id: Option<u32>,
    #[serde(default)]
    pub pad_token_id: Option<u32>,
}

impl Gpt2Config {
    fn inner_dim(&self) -> usize {
        self.n_inner.unwrap_or(4 * self.n_embd)
    }
}

/// GPT-2's "Conv1D": a linear layer whose weight is stored as `[in, out]`.
#[derive(Debug, Clone)]
struct Conv1D {
    weight: Tensor,
    bias: Tensor,
}

impl Conv1D {
    fn load(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(
            (in_dim, out_dim),
            "weight",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let bias = vb.get_with_hints(out_dim, "bias", candle_nn::init::ZERO)?;
        Ok(Self { weight, bias })
    }
}

impl Module for Conv1D {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.broadcast_matmul(&self.weight)?.broadcast_add(&self.bias)
    }
}

#[derive(Debug, Clone)]
struct Attention {
    c_attn: Conv1D,
    c_proj: Conv1D,
    n_head: usize,
    head_dim: usize,
    span: tracing::Span,
}

impl Attention {
    fn load(cfg: &Gpt2Config, vb: VarBuilder) -> Result<Self> {
        if cfg.n_embd % cfg.n_head != 0 {
            bail!("n_embd {} is not divisible by n_head {}", cfg.n_embd, cfg.n_head);
        }
        Ok(Self {
            c_attn: Conv1D::load(cfg.n_embd, 3 * cfg.n_embd, vb.pp("c_attn"))?,
            c_proj: Conv1D::load(cfg.n_embd, cfg.n_embd, vb.pp("c_proj"))?,
            n_head: cfg.n_head,
            head_dim: cfg.n_embd / cfg.n_head,
            span: tracing::span!(tracing::Level::TRACE, "gpt2-attn"),
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        blocked: &Tensor,
        kv_cache: &mut Option<(Tensor, Tensor)>,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (b_sz, seq_len, n_embd) = xs.dims3()?;
        let qkv = self.c_attn.forward(xs)?;

        let split_heads = |t: Tensor| -> Result<Tensor> {
            t.reshape((b_sz, seq_len, self.n_head, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = split_heads(qkv.narrow(D::Minus1, 0, n_embd)?)?;
        let k = split_heads(qkv.narrow(D::Minus1, n_embd, n_embd)?)?;
        let v = split_heads(qkv.narrow(D::Minus1, 2 * n_embd, n_embd)?)?;

        let (k, v) = match kv_cache.as_ref() {
            None => (k, v),
            Some((k_cache, v_cache)) => (
                Tensor::cat(&[k_cache, &k], 2)?,
                Tensor::cat(&[v_cache, &v], 2)?,
            ),
        };
        *kv_cache = Some((k.clone(), v.clone()));

        let dtype = q.dtype();
        let att = (q.matmul(&k.t()?)? / (self.head_dim as f64).sqrt())?;
        let att = att.to_dtype(DType::F32)?;
        let blocked = blocked.broadcast_as(att.shape())?;
        let min = Tensor::new(f32::MIN, att.device())?.broadcast_as(att.shape())?;
        let att = blocked.where_cond(&min, &att)?;
        let att = candle_nn::ops::softmax_last_dim(&att)?.to_dtype(dtype)?;

        let ys = att.matmul(&v)?;
        let ys = ys.transpose(1, 2)?.reshape((b_sz, seq_len, n_embd))?;
        self.c_proj.forward(&ys)
    }
}

#[derive(Debug, Clone)]
struct Mlp {
    c_fc: Conv1D,
    c_proj: Conv1D,
}

impl Mlp {
    fn load(cfg: &Gpt2Config, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            c_fc: Conv1D::load(cfg.n_embd, cfg.inner_dim(), vb.pp("c_fc"))?,
            c_proj: Conv1D::load(cfg.inner_dim(), cfg.n_embd, vb.pp("c_proj"))?,
        })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        // gelu() is the tanh approximation GPT-2 was trained with.
        self.c_proj.forward(&self.c_fc.forward(xs)?.gelu()?)
    }
}

#[derive(Debug, Clone)]
struct Block {
    ln_1: LayerNorm,
    attn: Attention,
    ln_2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    fn load(cfg: &Gpt2Config, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            ln_1: layer_norm(cfg.n_embd, cfg.layer_norm_epsilon, vb.pp("ln_1"))?,
            attn: Attention::load(cfg, vb.pp("attn"))?,
            ln_2: layer_norm(cfg.n_embd, cfg.layer_norm_epsilon, vb.pp("ln_2"))?,
            mlp: Mlp::load(cfg, vb.pp("mlp"))?,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        blocked: &Tensor,
        kv_cache: &mut Option<(Tensor, Tensor)>,
    ) -> Result<Tensor> {
        let attn = self.attn.forward(&self.ln_1.forward(xs)?, blocked, kv_cache)?;
        let xs = (xs + attn)?;
        let mlp = self.mlp.forward(&self.ln_2.forward(&xs)?)?;
        xs + mlp
    }
}

#[derive(Debug, Clone)]
pub struct Gpt2 {
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    lm_head: Linear,
    config: Gpt2Config,
    device: Device,
    span: tracing::Span,
}

impl Gpt2 {
    /// Build the model from a var builder. Checkpoints exported from
    /// `GPT2LMHeadModel` nest every weight under `transformer.`; plain
    /// `GPT2Model` exports do not. Both layouts are accepted.
    pub fn load(vb: VarBuilder, config: &Gpt2Config) -> Result<Self> {
        let device = vb.device().clone();
        let vb = if vb.contains_tensor("transformer.wte.weight") {
            vb.pp("transformer")
        } else {
            vb
        };

        let wte = embedding(config.vocab_size, config.n_embd, vb.pp("wte"))?;
        let wpe = embedding(config.n_positions, config.n_embd, vb.pp("wpe"))?;
        let blocks = (0..config.n_layer)
            .map(|i| Block::load(config, vb.pp(format!("h.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let ln_f = layer_norm(config.n_embd, config.layer_norm_epsilon, vb.pp("ln_f"))?;
        // Output projection is tied to the token embedding.
        let lm_head = Linear::new(wte.embeddings().clone(), None);

        Ok(Self {
            wte,
            wpe,
            blocks,
            ln_f,
            lm_head,
            config: config.clone(),
            device,
            span: tracing::span!(tracing::Level::TRACE, "gpt2"),
        })
    }

    pub fn config(&self) -> &Gpt2Config {
        &self.config
    }

    /// `1` where query `i` may not attend to key `j`: keys in the future or
    /// keys the attention mask zeroes out.
    fn blocked_positions(&self, attention_mask: &Tensor, seq_len: usize, offset: usize) -> Result<Tensor> {
        let total = offset + seq_len;
        let (rows, cols) = attention_mask.dims2()?;
        if rows != 1 || cols != total {
            bail!("attention mask shape ({rows}, {cols}) does not cover (1, {total})");
        }
        let keep = attention_mask.to_dtype(DType::U32)?.squeeze(0)?.to_vec1::<u32>()?;
        let blocked: Vec<u8> = (0..seq_len)
            .flat_map(|i| {
                let keep = &keep;
                (0..total).map(move |j| u8::from(j > offset + i || keep[j] == 0))
            })
            .collect();
        Tensor::from_vec(blocked, (1, 1, seq_len, total), &self.device)
    }
}

impl CausalLm for Gpt2 {
    fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor, cache: &mut KvCache) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (b_sz, seq_len) = input_ids.dims2()?;
        if b_sz != 1 {
            bail!("gpt2 forward expects a single sequence, got batch of {b_sz}");
        }
        if seq_len == 0 {
            bail!("gpt2 forward called with no input tokens");
        }
        if cache.num_layers() != self.blocks.len() {
            bail!(
                "kv cache has {} layers, model has {}",
                cache.num_layers(),
                self.blocks.len()
            );
        }
        let offset = cache.seen_tokens();
        if offset + seq_len > self.config.n_positions {
            bail!(
                "sequence of {} tokens exceeds the {} positions this model supports",
                offset + seq_len,
                self.config.n_positions
            );
        }

        let positions = Tensor::arange(offset as u32, (offset + seq_len) as u32, &self.device)?
            .unsqueeze(0)?;
        let mut xs = self
            .wte
            .forward(input_ids)?
            .broadcast_add(&self.wpe.forward(&positions)?)?;

        let blocked = self.blocked_positions(attention_mask, seq_len, offset)?;
        for (block, kv) in self.blocks.iter().zip(cache.layers_mut()) {
            xs = block.forward(&xs, &blocked, kv)?;
        }
        cache.advance(seq_len);

        let xs = self.ln_f.forward(&xs)?;
        let last = xs.i((.., seq_len - 1, ..))?;
        self.lm_head.forward(&last)?.to_dtype(DType::F32)
    }

    fn new_cache(&self) -> Result<KvCache> {
        Ok(KvCache::new(self.blocks.len()))
    }

    fn max_positions(&self) -> usize {
        self.config.n_positions
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn tiny_config() -> Gpt2Config {
        Gpt2Config {
            vocab_size: 20,
            n_positions: 16,
            n_embd: 8,
            n_layer: 2,
            n_head: 2,
            n_inner: None,
            layer_norm_epsilon: 1e-5,
            eos_token_id: Some(0),
            pad_token_id: None,
        }
    }

    fn tiny_model() -> Result<Gpt2> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        Gpt2::load(vb, &tiny_config())
    }

    fn ids(tokens: &[u32]) -> Result<Tensor> {
        Tensor::new(tokens, &Device::Cpu)?.unsqueeze(0)
    }

    fn ones(len: usize) -> Result<Tensor> {
        Tensor::ones((1, len), DType::U32, &Device::Cpu)
    }

    #[test]
    fn test_config_from_hub_json() {
        let config: Gpt2Config = serde_json::from_str(
            r#"{
                "activation_function": "gelu_new",
                "n_ctx": 1024,
                "n_embd": 768,
                "n_head": 12,
                "n_layer": 12,
                "n_positions": 1024,
                "vocab_size": 50257,
                "eos_token_id": 50256,
                "bos_token_id": 50256
            }"#,
        )
        .unwrap();
        assert_eq!(config.n_embd, 768);
        assert_eq!(config.inner_dim(), 3072);
        assert_eq!(config.eos_token_id, Some(50256));
        assert_eq!(config.layer_norm_epsilon, 1e-5);
    }

    #[test]
    fn test_logits_shape_and_cache_growth() -> Result<()> {
        let model = tiny_model()?;
        let mut cache = model.new_cache()?;
        let logits = model.forward(&ids(&[2, 3, 4])?, &ones(3)?, &mut cache)?;
        assert_eq!(logits.dims(), &[1, 20]);
        assert_eq!(logits.dtype(), DType::F32);
        assert_eq!(cache.seen_tokens(), 3);
        Ok(())
    }

    #[test]
    fn test_incremental_decoding_matches_full_pass() -> Result<()> {
        let model = tiny_model()?;

        let mut cache = model.new_cache()?;
        let full = model.forward(&ids(&[2, 3, 4, 5, 6])?, &ones(5)?, &mut cache)?;

        let mut cache = model.new_cache()?;
        model.forward(&ids(&[2, 3, 4, 5])?, &ones(4)?, &mut cache)?;
        let step = model.forward(&ids(&[6])?, &ones(5)?, &mut cache)?;

        let diff = (full - step)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        assert!(diff < 1e-4, "max difference {diff}");
        Ok(())
    }

    #[test]
    fn test_position_limit() -> Result<()> {
        let model = tiny_model()?;
        let mut cache = model.new_cache()?;
        let too_long: Vec<u32> = (0..17).map(|i| i % 20).collect();
        assert!(model.forward(&ids(&too_long)?, &ones(17)?, &mut cache).is_err());
        Ok(())
    }

    #[test]
    fn test_mask_must_cover_cached_positions() -> Result<()> {
        let model = tiny_model()?;
        let mut cache = model.new_cache()?;
        model.forward(&ids(&[2, 3])?, &ones(2)?, &mut cache)?;
        assert!(model.forward(&ids(&[4])?, &ones(1)?, &mut cache).is_err());
        Ok(())
    }
}
