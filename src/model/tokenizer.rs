use std::path::Path;
use std::sync::Arc;

use tokenizers::Tokenizer as HfTokenizer;

use crate::error::{EngineError, Result};

/// Candidate spellings of the end-of-sequence token, tried in order when the
/// model config does not name one.
const EOS_CANDIDATES: &[&str] = &["<|endoftext|>", "</s>", "[SEP]", "<eos>"];
const PAD_CANDIDATES: &[&str] = &["[PAD]", "<pad>", "<|pad|>"];

/// Token ids the model config may carry for its special tokens.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpecialTokenHints {
    pub eos_token_id: Option<u32>,
    pub pad_token_id: Option<u32>,
}

#[derive(Debug, Clone)]
struct SpecialTokens {
    eos_token_id: Option<u32>,
    pad_token_id: Option<u32>,
}

/// HuggingFace tokenizer plus the special tokens generation needs
#[derive(Clone)]
pub struct ModelTokenizer {
    tokenizer: Arc<HfTokenizer>,
    special_tokens: SpecialTokens,
}

impl std::fmt::Debug for ModelTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelTokenizer")
            .field("vocab_size", &self.vocab_size())
            .field("special_tokens", &self.special_tokens)
            .finish()
    }
}

impl ModelTokenizer {
    /// Load `tokenizer.json` from disk.
    pub fn from_file(path: impl AsRef<Path>, hints: SpecialTokenHints) -> Result<Self> {
        let path = path.as_ref();
        let tokenizer = HfTokenizer::from_file(path).map_err(|e| EngineError::ModelLoad {
            locator: path.display().to_string(),
            message: format!("Failed to load tokenizer: {e}"),
            source: None,
        })?;
        Ok(Self::new(tokenizer, hints))
    }

    pub fn new(tokenizer: HfTokenizer, hints: SpecialTokenHints) -> Self {
        let eos_token_id = hints
            .eos_token_id
            .or_else(|| EOS_CANDIDATES.iter().find_map(|t| tokenizer.token_to_id(t)));

        let pad_token_id = tokenizer
            .get_padding()
            .map(|p| p.pad_id)
            .or(hints.pad_token_id)
            .or_else(|| PAD_CANDIDATES.iter().find_map(|t| tokenizer.token_to_id(t)));

        Self {
            tokenizer: Arc::new(tokenizer),
            special_tokens: SpecialTokens {
                eos_token_id,
                pad_token_id,
            },
        }
    }

    /// Encode text to token ids. Truncation and padding follow whatever the
    /// tokenizer file configures.
    pub fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, add_special_tokens)
            .map_err(|e| EngineError::Inference {
                message: format!(
                    "Tokenization failed on '{}': {e}",
                    text.chars().take(50).collect::<String>()
                ),
                source: None,
            })?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Encode one dialogue turn: the text followed by the end-of-turn marker.
    pub fn encode_turn(&self, text: &str) -> Result<Vec<u32>> {
        let eos = self
            .eos_token_id()
            .ok_or_else(|| EngineError::inference("tokenizer has no end-of-sequence token"))?;
        let mut ids = self.encode(text, false)?;
        ids.push(eos);
        Ok(ids)
    }

    pub fn decode(&self, tokens: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.tokenizer
            .decode(tokens, skip_special_tokens)
            .map_err(|e| EngineError::Inference {
                message: format!("Decoding failed: {e}"),
                source: None,
            })
    }

    pub fn eos_token_id(&self) -> Option<u32> {
        self.special_tokens.eos_token_id
    }

    pub fn pad_token_id(&self) -> Option<u32> {
        self.special_tokens.pad_token_id
    }

    /// Pad token used during generation: the tokenizer's own, else eos.
    pub fn pad_or_eos(&self) -> Option<u32> {
        self.pad_token_id().or(self.eos_token_id())
    }

    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }
}
