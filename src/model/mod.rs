//! Model families, loading, caching and the runtimes that execute them

mod distilbert;
mod family;
mod gpt2;
mod llama;
mod loader;
mod manager;
mod runtime;
mod sampling;
mod tokenizer;

pub use distilbert::DistilBertClassifier;
pub use family::ModelFamily;
pub use gpt2::{Gpt2, Gpt2Config};
pub use llama::LlamaDecoder;
pub use loader::{is_model_dir, DecoderArchitecture, LoadedModel, ModelArtifacts, ModelLoader};
pub use manager::{ModelKey, ModelManager, ModelSource};
pub use runtime::{
    CausalLm, ClassifierRuntime, GeneratorRuntime, KvCache, SamplerFactory, SequenceClassifier,
    CONVERSATION_MAX_LENGTH,
};
pub use sampling::{argmax, LogitsSampler, SamplingStrategy, TokenSampler, MIN_SAMPLING_TEMPERATURE};
pub use tokenizer::{ModelTokenizer, SpecialTokenHints};
