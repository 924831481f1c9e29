// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Character text splitter.
//!
//! Documents are chunked before insertion into the vector store: fixed
//! chunk size with overlap, splitting on paragraph/line/space boundaries
//! where possible and falling back to hard character cuts.

use crate::error::{Error, Result};

/// Configuration for [`CharacterTextSplitter`].
#[derive(Debug, Clone)]
pub struct SplitterConfig {
    /// Maximum characters per chunk.
    pub chunk_size: usize,
    /// Characters of overlap carried between adjacent chunks.
    pub chunk_overlap: usize,
}

impl Default for SplitterConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
        }
    }
}

impl SplitterConfig {
    fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Generic(format!(
                "chunk_size must be > 0, got {}",
                self.chunk_size
            )));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(Error::Generic(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

/// Splits text into overlapping character chunks.
#[derive(Debug, Clone)]
pub struct CharacterTextSplitter {
    config: SplitterConfig,
}

impl Default for CharacterTextSplitter {
    fn default() -> Self {
        Self {
            config: SplitterConfig::default(),
        }
    }
}

impl CharacterTextSplitter {
    /// Create a splitter with the given configuration.
    ///
    /// # Errors
    ///
    /// Rejects a zero chunk size or an overlap not smaller than the chunk
    /// size.
    pub fn new(config: SplitterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Split one text into chunks.
    ///
    /// Prefers breaking at a paragraph, then a newline, then a space
    /// within the tail of the window; falls back to a hard cut.
    #[must_use]
    pub fn split(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        if chars.is_empty() {
            return Vec::new();
        }
        if chars.len() <= self.config.chunk_size {
            return vec![text.to_string()];
        }

        let mut chunks = Vec::new();
        let mut start = 0usize;
        while start < chars.len() {
            let hard_end = (start + self.config.chunk_size).min(chars.len());
            let end = if hard_end == chars.len() {
                hard_end
            } else {
                self.break_point(&chars, start, hard_end)
            };
            let chunk: String = chars[start..end].iter().collect();
            let trimmed = chunk.trim();
            if !trimmed.is_empty() {
                chunks.push(trimmed.to_string());
            }
            if end == chars.len() {
                break;
            }
            start = end.saturating_sub(self.config.chunk_overlap).max(start + 1);
        }
        chunks
    }

    /// Split many texts, pairing each chunk with its source index.
    #[must_use]
    pub fn split_all(&self, texts: &[String]) -> Vec<(usize, String)> {
        texts
            .iter()
            .enumerate()
            .flat_map(|(idx, text)| self.split(text).into_iter().map(move |c| (idx, c)))
            .collect()
    }

    /// Find a natural break inside the last quarter of the window.
    fn break_point(&self, chars: &[char], start: usize, hard_end: usize) -> usize {
        let window_start = start + (self.config.chunk_size * 3 / 4);
        for separator in ['\n', ' '] {
            if let Some(offset) = chars[window_start..hard_end]
                .iter()
                .rposition(|c| *c == separator)
            {
                return window_start + offset + 1;
            }
        }
        hard_end
    }
}
