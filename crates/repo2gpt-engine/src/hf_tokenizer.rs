//! Exact token counts from a HuggingFace `tokenizer.json`.

use std::path::Path;

use repo2gpt_core::tokens::{TokenizeError, Tokenizer};

pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    name: String,
}

impl HfTokenizer {
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let inner = tokenizers::Tokenizer::from_file(path).map_err(|e| e.to_string())?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "tokenizer".into());
        Ok(Self { inner, name })
    }
}

impl Tokenizer for HfTokenizer {
    fn count(&self, text: &str) -> Result<u64, TokenizeError> {
        self.inner
            .encode(text, false)
            .map(|encoding| encoding.len() as u64)
            .map_err(|e| TokenizeError(e.to_string()))
    }

    fn strategy(&self) -> String {
        format!("huggingface ({})", self.name)
    }

    fn is_exact(&self) -> bool {
        true
    }
}
