use std::sync::Arc;

use rlm_core::{ChunkDescriptor, Result, RlmError};

use crate::chunking;

/// The immutable text an engine analyses.
///
/// Offsets are in characters (Unicode scalar values), not bytes. Cloning and
/// slicing never copy the text: every view shares the root allocation, so a
/// parent engine and all of its nested engines read the same buffer.
#[derive(Clone)]
pub struct ContextBuffer {
    text: Arc<str>,
    /// Byte offset of each char boundary (plus the end). `None` for ASCII text,
    /// where char and byte offsets coincide.
    index: Option<Arc<[usize]>>,
    /// Char window into the root text.
    start: usize,
    end: usize,
}

impl ContextBuffer {
    pub fn new(text: impl Into<Arc<str>>) -> Self {
        let text: Arc<str> = text.into();
        let (index, chars) = if text.is_ascii() {
            (None, text.len())
        } else {
            let offsets: Arc<[usize]> = text
                .char_indices()
                .map(|(b, _)| b)
                .chain(std::iter::once(text.len()))
                .collect();
            let chars = offsets.len() - 1;
            (Some(offsets), chars)
        };
        Self {
            text,
            index,
            start: 0,
            end: chars,
        }
    }

    /// Length in characters.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    fn byte_at(&self, char_pos: usize) -> usize {
        match &self.index {
            Some(offsets) => offsets[char_pos],
            None => char_pos,
        }
    }

    fn check_bounds(&self, start: usize, end: usize) -> Result<()> {
        if start > end || end > self.len() {
            return Err(RlmError::Range {
                start: start as i64,
                end: end as i64,
                len: self.len(),
            });
        }
        Ok(())
    }

    fn str_range(&self, start: usize, end: usize) -> &str {
        let from = self.byte_at(self.start + start);
        let to = self.byte_at(self.start + end);
        &self.text[from..to]
    }

    /// The whole view as a string slice.
    pub fn as_str(&self) -> &str {
        self.str_range(0, self.len())
    }

    /// Characters `[start, end)`. Out-of-range bounds fail, never clamp.
    pub fn read_context(&self, start: usize, end: usize) -> Result<String> {
        self.check_bounds(start, end)?;
        Ok(self.str_range(start, end).to_string())
    }

    /// A view of `[start, end)` sharing this buffer's text.
    pub fn slice(&self, start: usize, end: usize) -> Result<ContextBuffer> {
        self.check_bounds(start, end)?;
        Ok(Self {
            text: Arc::clone(&self.text),
            index: self.index.clone(),
            start: self.start + start,
            end: self.start + end,
        })
    }

    /// Up to the first `max_chars` characters.
    pub fn preview(&self, max_chars: usize) -> &str {
        self.str_range(0, max_chars.min(self.len()))
    }

    /// Chunk descriptors over this buffer. Metadata only.
    pub fn plan_chunks(&self, chunk_size: usize, overlap: usize) -> Result<Vec<ChunkDescriptor>> {
        chunking::plan_chunks(self.len(), chunk_size, overlap)
    }

    /// Views for each descriptor, in order.
    pub fn chunk_views(&self, descriptors: &[ChunkDescriptor]) -> Result<Vec<ContextBuffer>> {
        descriptors
            .iter()
            .map(|d| self.slice(d.start, d.end))
            .collect()
    }
}

impl std::fmt::Debug for ContextBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextBuffer")
            .field("len", &self.len())
            .field("offset", &self.start)
            .finish()
    }
}

impl From<String> for ContextBuffer {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}

impl From<&str> for ContextBuffer {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}
