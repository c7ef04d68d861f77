//! DistilBERT encoder with the sequence classification head used by the
//! sentiment checkpoints (`pre_classifier` → ReLU → `classifier`).

use std::collections::BTreeMap;

use candle_core::{DType, Device, IndexOp, Module, Result, Tensor};
use candle_nn::{linear, Linear, VarBuilder};
use candle_transformers::models::distilbert::{Config, DistilBertModel};
use serde::Deserialize;

use super::runtime::SequenceClassifier;

/// Head-related fields of `config.json`; the encoder reads its own.
#[derive(Debug, Clone, Deserialize)]
struct HeadConfig {
    dim: usize,
    max_position_embeddings: usize,
    #[serde(default)]
    id2label: BTreeMap<String, String>,
    #[serde(default)]
    num_labels: Option<usize>,
}

impl HeadConfig {
    fn num_labels(&self) -> usize {
        if !self.id2label.is_empty() {
            self.id2label.len()
        } else {
            self.num_labels.unwrap_or(2)
        }
    }

    /// Label names ordered by class index. Missing indices are named `LABEL_i`.
    fn labels(&self) -> Vec<String> {
        (0..self.num_labels())
            .map(|i| {
                self.id2label
                    .get(&i.to_string())
                    .cloned()
                    .unwrap_or_else(|| format!("LABEL_{i}"))
            })
            .collect()
    }
}

pub struct DistilBertClassifier {
    encoder: DistilBertModel,
    pre_classifier: Linear,
    classifier: Linear,
    labels: Vec<String>,
    max_positions: usize,
    device: Device,
    span: tracing::Span,
}

impl DistilBertClassifier {
    /// Build from the raw `config.json` text. Weights exported from
    /// `DistilBertForSequenceClassification` keep the encoder under
    /// `distilbert.`; bare encoder exports are accepted too.
    pub fn load(vb: VarBuilder, config_json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(config_json).map_err(candle_core::Error::wrap)?;
        let head: HeadConfig = serde_json::from_str(config_json).map_err(candle_core::Error::wrap)?;

        let encoder_vb = if vb.contains_tensor("distilbert.embeddings.word_embeddings.weight") {
            vb.pp("distilbert")
        } else {
            vb.clone()
        };
        let encoder = DistilBertModel::load(encoder_vb, &config)?;
        let pre_classifier = linear(head.dim, head.dim, vb.pp("pre_classifier"))?;
        let classifier = linear(head.dim, head.num_labels(), vb.pp("classifier"))?;

        Ok(Self {
            encoder,
            pre_classifier,
            classifier,
            labels: head.labels(),
            max_positions: head.max_position_embeddings,
            device: vb.device().clone(),
            span: tracing::span!(tracing::Level::TRACE, "distilbert-cls"),
        })
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }
}

impl SequenceClassifier for DistilBertClassifier {
    fn logits(&self, input_ids: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (_, seq_len) = input_ids.dims2()?;
        // Nothing is masked for a single unpadded sequence.
        let mask = Tensor::zeros((seq_len, seq_len), DType::U8, &self.device)?;
        let hidden = self.encoder.forward(input_ids, &mask)?;

        let pooled = hidden.i((.., 0))?;
        let pooled = self.pre_classifier.forward(&pooled)?.relu()?;
        self.classifier.forward(&pooled)?.squeeze(0)?.to_dtype(DType::F32)
    }

    fn max_positions(&self) -> usize {
        self.max_positions
    }

    fn device(&self) -> &Device {
        &self.device
    }
}
