//! Token-budgeted consolidation of included files into ordered chunks.
//!
//! Files are taken whole and in the order given. A chunk is closed before a
//! file that would push it over the limit, so boundaries only ever fall
//! between files. A file larger than the limit on its own gets a chunk to
//! itself.

use std::path::PathBuf;

use repo2gpt_core::job::{Chunk, TokenTotals};
use repo2gpt_core::tokens::{TokenizeError, Tokenizer};

#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("token estimation failed for {path}: {source}")]
    Estimator {
        path: String,
        #[source]
        source: TokenizeError,
    },

    #[error("token count overflow at {0}")]
    Overflow(String),
}

/// Render one file the way it appears inside a chunk.
pub fn file_block(relative_path: &str, content: &str) -> String {
    format!("\n\n---\n{relative_path}\n---\n\n{content}")
}

#[derive(Default)]
struct OpenChunk {
    files: Vec<String>,
    content: String,
    tokens: u64,
}

/// Incremental chunk builder. Feed files with [`Chunker::push`] and collect
/// the remainder with [`Chunker::finish`].
pub struct Chunker<'a> {
    tokenizer: &'a dyn Tokenizer,
    limit: u64,
    next_index: usize,
    total_tokens: u64,
    current: OpenChunk,
}

impl<'a> Chunker<'a> {
    /// `limit == 0` places everything in a single chunk.
    pub fn new(tokenizer: &'a dyn Tokenizer, limit: u64) -> Self {
        Self {
            tokenizer,
            limit,
            next_index: 0,
            total_tokens: 0,
            current: OpenChunk::default(),
        }
    }

    /// Add a file. Returns the chunk that had to be closed to make room, if any.
    pub fn push(&mut self, relative_path: &str, content: &str) -> Result<Option<Chunk>, ChunkError> {
        let block = file_block(relative_path, content);
        let tokens = self
            .tokenizer
            .count(&block)
            .map_err(|source| ChunkError::Estimator {
                path: relative_path.to_string(),
                source,
            })?;

        let closed = if self.limit > 0
            && !self.current.files.is_empty()
            && self.current.tokens.saturating_add(tokens) > self.limit
        {
            Some(self.close())
        } else {
            None
        };

        self.current.tokens = self
            .current
            .tokens
            .checked_add(tokens)
            .ok_or_else(|| ChunkError::Overflow(relative_path.to_string()))?;
        self.current.files.push(relative_path.to_string());
        self.current.content.push_str(&block);
        Ok(closed)
    }

    /// Close the last chunk. Input with no files still yields one empty chunk.
    pub fn finish(mut self) -> (Option<Chunk>, TokenTotals) {
        let last = if !self.current.files.is_empty() || self.next_index == 0 {
            Some(self.close())
        } else {
            None
        };
        let totals = TokenTotals {
            chunk_tokens: self.total_tokens,
            repo_map_tokens: 0,
            chunk_count: self.next_index,
        };
        (last, totals)
    }

    fn close(&mut self) -> Chunk {
        let open = std::mem::take(&mut self.current);
        self.total_tokens += open.tokens;
        let chunk = Chunk {
            index: self.next_index,
            token_count: open.tokens,
            files: open.files,
            content: open.content,
        };
        self.next_index += 1;
        chunk
    }
}
