use std::path::Path;

use tokenizers::Tokenizer;

use crate::error::{InferenceError, Result};

/// Text ↔ token id conversion used by generation and model sizing.
pub trait TextTokenizer {
    /// Vocabulary size, including special tokens
    fn n_words(&self) -> usize;

    fn bos_id(&self) -> Option<u32>;

    fn eos_id(&self) -> Option<u32>;

    fn encode(&self, text: &str, bos: bool) -> Result<Vec<u32>>;

    fn decode(&self, ids: &[u32]) -> Result<String>;
}

const BOS_CANDIDATES: &[&str] = &["<s>", "<|begin_of_text|>", "<bos>"];
const EOS_CANDIDATES: &[&str] = &["</s>", "<|end_of_text|>", "<eos>"];

/// `tokenizer.json` backed tokenizer
pub struct HfTokenizer {
    inner: Tokenizer,
    bos: Option<u32>,
    eos: Option<u32>,
}

impl HfTokenizer {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let inner = Tokenizer::from_file(path.as_ref()).map_err(|e| {
            InferenceError::TokenizationError(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Ok(Self::new(inner))
    }

    pub fn new(inner: Tokenizer) -> Self {
        let find = |candidates: &[&str]| candidates.iter().find_map(|t| inner.token_to_id(t));
        let bos = find(BOS_CANDIDATES);
        let eos = find(EOS_CANDIDATES);
        Self { inner, bos, eos }
    }
}

impl TextTokenizer for HfTokenizer {
    fn n_words(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn bos_id(&self) -> Option<u32> {
        self.bos
    }

    fn eos_id(&self) -> Option<u32> {
        self.eos
    }

    fn encode(&self, text: &str, bos: bool) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| InferenceError::TokenizationError(e.to_string()))?;
        let mut ids = Vec::with_capacity(encoding.len() + 1);
        if bos {
            ids.extend(self.bos);
        }
        ids.extend_from_slice(encoding.get_ids());
        Ok(ids)
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| InferenceError::TokenizationError(e.to_string()))
    }
}
