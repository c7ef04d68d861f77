use std::error::Error as StdError;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use serde::Deserialize;
use tracing::{debug, info};

use super::distilbert::DistilBertClassifier;
use super::family::ModelFamily;
use super::gpt2::{Gpt2, Gpt2Config};
use super::llama::LlamaDecoder;
use super::runtime::{CausalLm, ClassifierRuntime, GeneratorRuntime};
use super::tokenizer::{ModelTokenizer, SpecialTokenHints};
use crate::error::{EngineError, Result};
use crate::types::{ModelDescriptor, NumericPrecision};

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const WEIGHTS_EXTENSION: &str = "safetensors";

/// A model ready to serve, bound to the device it was built on.
pub enum LoadedModel {
    Classifier(ClassifierRuntime),
    Generator(GeneratorRuntime),
}

impl LoadedModel {
    pub fn family(&self) -> ModelFamily {
        match self {
            LoadedModel::Classifier(_) => ModelFamily::SequenceClassification,
            LoadedModel::Generator(runtime) => runtime.family(),
        }
    }

    pub fn as_classifier(&self) -> Option<&ClassifierRuntime> {
        match self {
            LoadedModel::Classifier(runtime) => Some(runtime),
            LoadedModel::Generator(_) => None,
        }
    }

    pub fn as_generator(&self) -> Option<&GeneratorRuntime> {
        match self {
            LoadedModel::Generator(runtime) => Some(runtime),
            LoadedModel::Classifier(_) => None,
        }
    }
}

/// Files making up a local Hugging Face style model directory.
#[derive(Debug, Clone)]
pub struct ModelArtifacts {
    pub dir: PathBuf,
    pub config_json: String,
    pub tokenizer: PathBuf,
    /// Sorted so sharded checkpoints load in order.
    pub weights: Vec<PathBuf>,
}

impl ModelArtifacts {
    pub fn discover(locator: &str) -> Result<Self> {
        let dir = PathBuf::from(locator);
        if !dir.is_dir() {
            return Err(EngineError::model_load(locator, "not an existing model directory"));
        }

        let config_path = dir.join(CONFIG_FILE);
        let config_json = fs::read_to_string(&config_path)
            .map_err(|e| load_error(locator, format!("cannot read {CONFIG_FILE}"), e))?;

        let tokenizer = dir.join(TOKENIZER_FILE);
        if !tokenizer.is_file() {
            return Err(EngineError::model_load(locator, format!("{TOKENIZER_FILE} not found")));
        }

        let mut weights = fs::read_dir(&dir)
            .map_err(|e| load_error(locator, "cannot list model directory", e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == WEIGHTS_EXTENSION))
            .collect::<Vec<_>>();
        if weights.is_empty() {
            return Err(EngineError::model_load(locator, "no .safetensors weights found"));
        }
        weights.sort();

        Ok(Self {
            dir,
            config_json,
            tokenizer,
            weights,
        })
    }

    fn var_builder(&self, dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
        // SAFETY: the weight files are treated as read-only for the lifetime
        // of the mapping.
        unsafe { VarBuilder::from_mmaped_safetensors(&self.weights, dtype, device) }
            .map_err(|e| load_error(&self.locator(), "cannot map safetensors weights", e))
    }

    fn locator(&self) -> String {
        self.dir.display().to_string()
    }
}

/// Llama 3 style configs list several end-of-sequence ids.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TokenIdList {
    Single(u32),
    Multiple(Vec<u32>),
}

impl TokenIdList {
    fn first(&self) -> Option<u32> {
        match self {
            TokenIdList::Single(id) => Some(*id),
            TokenIdList::Multiple(ids) => ids.first().copied(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct TokenIds {
    #[serde(default)]
    eos_token_id: Option<TokenIdList>,
    #[serde(default)]
    pad_token_id: Option<TokenIdList>,
}

#[derive(Debug, Default, Deserialize)]
struct Architecture {
    #[serde(default)]
    model_type: Option<String>,
}

/// Decoder architectures the generation families can be built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderArchitecture {
    Gpt2,
    Llama,
}

impl DecoderArchitecture {
    /// Pick the architecture from `model_type` in `config.json`. GPT-2 is
    /// assumed when the field is absent.
    pub fn detect(locator: &str, config_json: &str) -> Result<Self> {
        let arch: Architecture = serde_json::from_str(config_json)
            .map_err(|e| load_error(locator, format!("malformed {CONFIG_FILE}"), e))?;
        match arch.model_type.as_deref() {
            None | Some("gpt2") => Ok(DecoderArchitecture::Gpt2),
            Some("llama") => Ok(DecoderArchitecture::Llama),
            Some(other) => Err(EngineError::model_load(
                locator,
                format!("unsupported architecture '{other}' for text generation"),
            )),
        }
    }
}

/// Builds models from descriptors. Stateless; caching is the manager's job.
#[derive(Debug, Clone, Default)]
pub struct ModelLoader;

impl ModelLoader {
    pub fn new() -> Self {
        Self
    }

    /// Load the model a descriptor names onto `device`. Blocking.
    pub fn load(&self, descriptor: &ModelDescriptor, device: &Device) -> Result<LoadedModel> {
        let family = descriptor.family();
        let artifacts = ModelArtifacts::discover(&descriptor.locator)?;
        info!(
            locator = %descriptor.locator,
            %family,
            shards = artifacts.weights.len(),
            device = ?device,
            "Loading model"
        );

        match family {
            ModelFamily::SequenceClassification => self.load_classifier(&artifacts, device),
            ModelFamily::Conversational | ModelFamily::CausalGeneration => self.load_generator(
                &artifacts,
                family,
                descriptor.parameters.numeric_precision,
                device,
            ),
        }
    }

    /// Classifiers always run at float32, whatever precision was asked for.
    fn load_classifier(&self, artifacts: &ModelArtifacts, device: &Device) -> Result<LoadedModel> {
        let vb = artifacts.var_builder(DType::F32, device)?;
        let model = DistilBertClassifier::load(vb, &artifacts.config_json)
            .map_err(|e| load_error(&artifacts.locator(), "cannot build classifier", e))?;
        let tokenizer = ModelTokenizer::from_file(&artifacts.tokenizer, token_hints(&artifacts.config_json))?;
        let labels = model.labels().to_vec();

        Ok(LoadedModel::Classifier(ClassifierRuntime::new(
            Arc::new(model),
            tokenizer,
            labels,
        )))
    }

    fn load_generator(
        &self,
        artifacts: &ModelArtifacts,
        family: ModelFamily,
        precision: NumericPrecision,
        device: &Device,
    ) -> Result<LoadedModel> {
        let locator = artifacts.locator();
        let architecture = DecoderArchitecture::detect(&locator, &artifacts.config_json)?;
        let model: Arc<dyn CausalLm> = match architecture {
            DecoderArchitecture::Gpt2 => {
                let config: Gpt2Config = serde_json::from_str(&artifacts.config_json)
                    .map_err(|e| load_error(&locator, format!("malformed {CONFIG_FILE}"), e))?;
                let vb = artifacts.var_builder(precision.dtype(), device)?;
                let model =
                    Gpt2::load(vb, &config).map_err(|e| load_error(&locator, "cannot build decoder", e))?;
                Arc::new(model)
            }
            DecoderArchitecture::Llama => {
                let vb = artifacts.var_builder(precision.dtype(), device)?;
                let model = LlamaDecoder::load(vb, &artifacts.config_json)
                    .map_err(|e| load_error(&locator, "cannot build decoder", e))?;
                Arc::new(model)
            }
        };
        debug!(locator = %locator, ?architecture, "Built decoder");
        let tokenizer = ModelTokenizer::from_file(&artifacts.tokenizer, token_hints(&artifacts.config_json))?;

        Ok(LoadedModel::Generator(GeneratorRuntime::new(model, tokenizer, family)))
    }
}

fn token_hints(config_json: &str) -> SpecialTokenHints {
    let ids: TokenIds = serde_json::from_str(config_json).unwrap_or_default();
    SpecialTokenHints {
        eos_token_id: ids.eos_token_id.as_ref().and_then(TokenIdList::first),
        pad_token_id: ids.pad_token_id.as_ref().and_then(TokenIdList::first),
    }
}

fn load_error(
    locator: &str,
    message: impl Into<String>,
    source: impl StdError + Send + Sync + 'static,
) -> EngineError {
    EngineError::ModelLoad {
        locator: locator.to_string(),
        message: format!("{}: {source}", message.into()),
        source: Some(Box::new(source)),
    }
}

/// Does `path` look like a model directory the loader can read?
pub fn is_model_dir(path: impl AsRef<Path>) -> bool {
    let path = path.as_ref();
    path.join(CONFIG_FILE).is_file() && path.join(TOKENIZER_FILE).is_file()
}


#[cfg(test)]
mod tests {
    use super::testing::{write_tiny_model, TINY_GPT2_CONFIG, TINY_LLAMA_CONFIG};
    use super::*;
    use crate::types::GenerationParameters;
    use tokio_util::sync::CancellationToken;

    fn descriptor(path: &Path) -> ModelDescriptor {
        ModelDescriptor::new(path.display().to_string())
    }

    #[test]
    fn test_missing_directory() {
        let result = ModelLoader::new().load(&ModelDescriptor::new("/nonexistent/gpt2"), &Device::Cpu);
        assert!(matches!(result, Err(EngineError::ModelLoad { .. })));
    }

    #[test]
    fn test_missing_artifacts() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("gpt2");
        fs::create_dir(&dir).unwrap();

        let err = ModelArtifacts::discover(dir.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("config.json"), "{err}");

        fs::write(dir.join(CONFIG_FILE), "{}").unwrap();
        let err = ModelArtifacts::discover(dir.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("tokenizer.json"), "{err}");

        fs::write(dir.join(TOKENIZER_FILE), "{}").unwrap();
        let err = ModelArtifacts::discover(dir.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("safetensors"), "{err}");
        assert!(is_model_dir(&dir));
    }

    #[test]
    fn test_weight_shards_sorted() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path();
        fs::write(dir.join(CONFIG_FILE), "{}").unwrap();
        fs::write(dir.join(TOKENIZER_FILE), "{}").unwrap();
        for shard in ["model-00002-of-00002.safetensors", "model-00001-of-00002.safetensors", "notes.txt"] {
            fs::write(dir.join(shard), b"").unwrap();
        }

        let artifacts = ModelArtifacts::discover(dir.to_str().unwrap()).unwrap();
        let names: Vec<_> = artifacts
            .weights
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec!["model-00001-of-00002.safetensors", "model-00002-of-00002.safetensors"]
        );
    }

    #[test]
    fn test_malformed_config_is_load_error() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_tiny_model(root.path(), "gpt2-tiny");
        fs::write(dir.join(CONFIG_FILE), r#"{"n_embd": "wide"}"#).unwrap();
        let result = ModelLoader::new().load(&descriptor(&dir), &Device::Cpu);
        assert!(matches!(result, Err(EngineError::ModelLoad { .. })));
    }

    #[test]
    fn test_load_generator_families() {
        let root = tempfile::tempdir().unwrap();
        let loader = ModelLoader::new();

        let causal = write_tiny_model(root.path(), "gpt2-tiny");
        let model = loader.load(&descriptor(&causal), &Device::Cpu).unwrap();
        assert_eq!(model.family(), ModelFamily::CausalGeneration);

        let params = GenerationParameters {
            max_length: 5,
            ..Default::default()
        };
        let out = model
            .as_generator()
            .unwrap()
            .generate("hello world", &params, None, &CancellationToken::new())
            .unwrap();
        assert!(out.state.is_none());

        let chat = write_tiny_model(root.path(), "DialoGPT-tiny");
        let model = loader.load(&descriptor(&chat), &Device::Cpu).unwrap();
        assert_eq!(model.family(), ModelFamily::Conversational);
        assert!(model.as_classifier().is_none());
    }

    #[test]
    fn test_load_llama_decoder() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_tiny_model(root.path(), "tiny-llama");
        let model = ModelLoader::new().load(&descriptor(&dir), &Device::Cpu).unwrap();
        assert_eq!(model.family(), ModelFamily::CausalGeneration);

        let params = GenerationParameters {
            max_length: 6,
            ..Default::default()
        };
        let out = model
            .as_generator()
            .unwrap()
            .generate("hello world", &params, None, &CancellationToken::new())
            .unwrap();
        assert!(out.text.starts_with("hello world"));
        assert!(out.text.split_whitespace().count() <= 6);
        assert!(out.state.is_none());
    }

    #[test]
    fn test_unsupported_architecture() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_tiny_model(root.path(), "gpt2-tiny");
        fs::write(dir.join(CONFIG_FILE), r#"{"model_type": "mamba", "d_model": 8}"#).unwrap();

        let err = ModelLoader::new().load(&descriptor(&dir), &Device::Cpu).err().unwrap();
        assert!(matches!(err, EngineError::ModelLoad { .. }));
        assert!(err.to_string().contains("unsupported architecture 'mamba'"), "{err}");
    }

    #[test]
    fn test_architecture_detection() {
        assert_eq!(DecoderArchitecture::detect("m", "{}").unwrap(), DecoderArchitecture::Gpt2);
        assert_eq!(
            DecoderArchitecture::detect("m", r#"{"model_type": "gpt2"}"#).unwrap(),
            DecoderArchitecture::Gpt2
        );
        assert_eq!(
            DecoderArchitecture::detect("m", r#"{"model_type": "llama"}"#).unwrap(),
            DecoderArchitecture::Llama
        );
        assert!(DecoderArchitecture::detect("m", "not json").is_err());
    }

    #[test]
    fn test_token_hints_accept_id_lists() {
        let hints = token_hints(TINY_LLAMA_CONFIG);
        assert_eq!(hints.eos_token_id, Some(0));
        assert_eq!(hints.pad_token_id, None);
        assert_eq!(token_hints(TINY_GPT2_CONFIG).eos_token_id, Some(0));
    }

    #[test]
    fn test_load_reduced_precision() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_tiny_model(root.path(), "gpt2-half");
        let mut descriptor = descriptor(&dir);
        descriptor.parameters.numeric_precision = NumericPrecision::BFloat16;
        let model = ModelLoader::new().load(&descriptor, &Device::Cpu).unwrap();
        assert_eq!(model.family(), ModelFamily::CausalGeneration);
    }

    #[test]
    fn test_load_classifier() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_tiny_model(root.path(), "distilbert-tiny-sst2");
        let model = ModelLoader::new().load(&descriptor(&dir), &Device::Cpu).unwrap();

        let classifier = model.as_classifier().unwrap();
        assert_eq!(classifier.labels(), &["NEGATIVE", "POSITIVE"]);
        let class = classifier.classify("i love this").unwrap();
        assert!(class < 2);
        assert_eq!(classifier.classify("i love this").unwrap(), class);
    }
}
