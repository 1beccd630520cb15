//! Embedding models that run inside a worker.
//!
//! Models are synchronous and owned by exactly one worker, which calls them from
//! a blocking task. Two implementations ship:
//!
//! - [`FastEmbedModel`]: local ONNX models via FastEmbed.
//! - [`HashingModel`]: deterministic feature hashing. It needs no model files,
//!   which makes it the model of choice for tests and offline smoke runs.
use crate::config::{EmbedConfig, ModelSpec};
use crate::error::{EmbedError, Result};
use fastembed::{EmbeddingModel as FastEmbedKind, InitOptions, TextEmbedding};
use fnv::FnvHasher;
use serde::{Deserialize, Serialize};
use std::hash::Hasher;

/// Whether a text is a search query or a passage being indexed. Asymmetric
/// models encode the two differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbedRole {
    Query,
    Passage,
}

pub trait EmbeddingModel: Send {
    fn embed(&mut self, texts: &[String], role: EmbedRole) -> Result<Vec<Vec<f32>>>;

    fn dimension(&self) -> usize;

    fn name(&self) -> &str;
}

/// Build the model described by `config`. Blocking: may download model files.
pub fn load_model(config: &EmbedConfig) -> Result<Box<dyn EmbeddingModel>> {
    config.validate()?;
    match &config.model {
        ModelSpec::Hashing { dimension } => Ok(Box::new(HashingModel::new(*dimension))),
        ModelSpec::FastEmbed {
            model_name,
            cache_dir,
        } => {
            let mut model = FastEmbedModel::load(model_name, cache_dir.clone())?;
            if let Some(prefix) = &config.query_prefix {
                model.query_prefix = prefix.clone();
            }
            if let Some(prefix) = &config.passage_prefix {
                model.passage_prefix = prefix.clone();
            }
            Ok(Box::new(model))
        }
    }
}

/// Scale `vector` to unit length in place. Zero vectors are left untouched.
pub fn normalize_l2(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        vector.iter_mut().for_each(|x| *x /= norm);
    }
}

/// Signed feature hashing of lower-cased word unigrams and bigrams.
///
/// Texts sharing vocabulary land close together under cosine similarity, which
/// is enough to exercise retrieval end to end without a neural model.
#[derive(Debug, Clone)]
pub struct HashingModel {
    dimension: usize,
    name: String,
}

impl HashingModel {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
            name: format!("hashing-{dimension}"),
        }
    }

    fn bucket(&self, feature: &str) -> (usize, f32) {
        let mut hasher = FnvHasher::default();
        hasher.write(feature.as_bytes());
        let hash = hasher.finish();
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        ((hash % self.dimension as u64) as usize, sign)
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let words: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();

        for word in &words {
            let (index, sign) = self.bucket(word);
            vector[index] += sign;
        }
        for pair in words.windows(2) {
            let (index, sign) = self.bucket(&format!("{} {}", pair[0], pair[1]));
            vector[index] += 0.5 * sign;
        }
        normalize_l2(&mut vector);
        vector
    }
}

impl EmbeddingModel for HashingModel {
    fn embed(&mut self, texts: &[String], _role: EmbedRole) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// FastEmbed model plus the role prefixes it was trained with.
pub struct FastEmbedModel {
    model: TextEmbedding,
    name: String,
    dimension: usize,
    query_prefix: String,
    passage_prefix: String,
}

/// Resolve a model name to the FastEmbed model and its (query, passage) prefixes.
fn resolve_fastembed(name: &str) -> Result<(FastEmbedKind, &'static str, &'static str)> {
    let resolved = match name.to_ascii_lowercase().as_str() {
        "all-minilm-l6-v2" | "sentence-transformers/all-minilm-l6-v2" => {
            (FastEmbedKind::AllMiniLML6V2, "", "")
        }
        "bge-small-en-v1.5" | "baai/bge-small-en-v1.5" => (
            FastEmbedKind::BGESmallENV15,
            "Represent this sentence for searching relevant passages: ",
            "",
        ),
        "multilingual-e5-small" | "intfloat/multilingual-e5-small" => {
            (FastEmbedKind::MultilingualE5Small, "query: ", "passage: ")
        }
        "nomic-embed-text-v1.5" | "nomic-ai/nomic-embed-text-v1.5" => (
            FastEmbedKind::NomicEmbedTextV15,
            "search_query: ",
            "search_document: ",
        ),
        other => {
            return Err(EmbedError::invalid_config(format!(
                "unsupported model '{other}'"
            )));
        }
    };
    Ok(resolved)
}

impl FastEmbedModel {
    pub fn load(model_name: &str, cache_dir: Option<std::path::PathBuf>) -> Result<Self> {
        let (kind, query_prefix, passage_prefix) = resolve_fastembed(model_name)?;
        tracing::info!("Loading embedding model: {}", model_name);

        let mut options = InitOptions::new(kind).with_show_download_progress(false);
        if let Some(dir) = cache_dir {
            options = options.with_cache_dir(dir);
        }
        let mut model = TextEmbedding::try_new(options).map_err(|e| {
            EmbedError::ModelInitialization {
                message: e.to_string(),
            }
        })?;

        // Probe once to learn the output dimension.
        let probe = model
            .embed(vec!["dimension probe"], None)
            .map_err(|e| EmbedError::ModelInitialization {
                message: e.to_string(),
            })?;
        let dimension = probe.first().map(Vec::len).unwrap_or_default();
        if dimension == 0 {
            return Err(EmbedError::ModelInitialization {
                message: format!("model '{model_name}' produced an empty probe embedding"),
            });
        }
        tracing::info!("Model loaded successfully. Dimension: {}", dimension);

        Ok(Self {
            model,
            name: model_name.to_string(),
            dimension,
            query_prefix: query_prefix.to_string(),
            passage_prefix: passage_prefix.to_string(),
        })
    }
}

impl EmbeddingModel for FastEmbedModel {
    fn embed(&mut self, texts: &[String], role: EmbedRole) -> Result<Vec<Vec<f32>>> {
        let prefix = match role {
            EmbedRole::Query => &self.query_prefix,
            EmbedRole::Passage => &self.passage_prefix,
        };
        let inputs: Vec<String> = texts.iter().map(|t| format!("{prefix}{t}")).collect();
        self.model
            .embed(inputs, None)
            .map_err(|e| EmbedError::model(e.to_string()))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn test_hashing_model_is_deterministic_and_normalized() {
        let mut model = HashingModel::new(128);
        let texts = vec!["Rust ownership and borrowing".to_string()];

        let a = model.embed(&texts, EmbedRole::Passage).unwrap();
        let b = model.embed(&texts, EmbedRole::Query).unwrap();

        assert_eq!(a, b);
        assert_eq!(a[0].len(), 128);
        let norm: f32 = a[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hashing_model_ranks_shared_vocabulary_higher() {
        let model = HashingModel::new(256);
        let query = model.embed_one("sqlite write ahead log");
        let related = model.embed_one("The write ahead log makes sqlite durable.");
        let unrelated = model.embed_one("Bananas are rich in potassium.");

        assert!(cosine(&query, &related) > cosine(&query, &unrelated));
    }

    #[test]
    fn test_empty_text_gives_zero_vector() {
        let model = HashingModel::new(8);
        assert!(model.embed_one("  ...  ").iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_unknown_fastembed_model_is_rejected() {
        let err = load_model(&EmbedConfig::fastembed("no-such-model")).err().unwrap();
        assert!(matches!(err, EmbedError::InvalidConfig { .. }));
    }

    #[test]
    fn test_load_hashing_model() {
        let model = load_model(&EmbedConfig::hashing(32)).unwrap();
        assert_eq!(model.dimension(), 32);
        assert_eq!(model.name(), "hashing-32");
    }
}
