//! N-gram tokenization of chunk lines into blooms.

use crate::bloom::Bloom;
use crate::error::Result;
use crate::schema::Schema;
use crate::types::ChunkRef;

/// Length of the per-chunk token prefix: `from u64 | through u64 | checksum u32`.
const CHUNK_PREFIX_LEN: usize = 8 + 8 + 4;

/// Splits a line into n-grams of `n` characters, starting every `skip + 1` characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NGramTokenizer {
    n: usize,
    skip: usize,
}

impl NGramTokenizer {
    pub fn new(n: usize, skip: usize) -> Self {
        Self { n, skip }
    }

    pub fn tokens<'a>(&self, line: &'a str) -> NGrams<'a> {
        // Byte offset of every char boundary, including the end of the line.
        let mut bounds: Vec<usize> = line.char_indices().map(|(i, _)| i).collect();
        bounds.push(line.len());
        NGrams {
            line,
            bounds,
            n: self.n,
            step: self.skip + 1,
            pos: 0,
        }
    }
}

pub struct NGrams<'a> {
    line: &'a str,
    bounds: Vec<usize>,
    n: usize,
    step: usize,
    pos: usize,
}

impl<'a> Iterator for NGrams<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        if self.n == 0 {
            return None;
        }
        let end = self.pos.checked_add(self.n)?;
        if end >= self.bounds.len() {
            return None;
        }
        let token = &self.line[self.bounds[self.pos]..self.bounds[end]];
        self.pos += self.step;
        Some(token)
    }
}

/// Populates blooms from chunk lines according to a schema.
///
/// Every n-gram is inserted twice: bare (series-level filtering) and prefixed
/// with the chunk reference (chunk-level filtering).
#[derive(Debug, Clone)]
pub struct BloomTokenizer {
    ngrams: NGramTokenizer,
}

impl BloomTokenizer {
    pub fn new(schema: &Schema) -> Self {
        Self {
            ngrams: NGramTokenizer::new(schema.ngram_length as usize, schema.ngram_skip as usize),
        }
    }

    /// Tokenizes every line of one chunk into `bloom`, returning the number of lines read.
    pub fn populate<I>(&self, bloom: &mut Bloom, chunk: &ChunkRef, lines: I) -> Result<usize>
    where
        I: IntoIterator<Item = Result<String>>,
    {
        let mut key = Vec::with_capacity(CHUNK_PREFIX_LEN + 64);
        key.extend_from_slice(&chunk_prefix(chunk));
        let mut read = 0usize;
        for line in lines {
            let line = line?;
            read += 1;
            for token in self.ngrams.tokens(&line) {
                bloom.insert(token.as_bytes());
                key.truncate(CHUNK_PREFIX_LEN);
                key.extend_from_slice(token.as_bytes());
                bloom.insert(&key);
            }
        }
        Ok(read)
    }
}

/// Key under which `token` is recorded for `chunk`; use with [`Bloom::test`] to check one chunk.
pub fn chunk_token_key(chunk: &ChunkRef, token: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(CHUNK_PREFIX_LEN + token.len());
    key.extend_from_slice(&chunk_prefix(chunk));
    key.extend_from_slice(token.as_bytes());
    key
}

fn chunk_prefix(chunk: &ChunkRef) -> [u8; CHUNK_PREFIX_LEN] {
    let mut out = [0u8; CHUNK_PREFIX_LEN];
    out[..8].copy_from_slice(&chunk.from.to_le_bytes());
    out[8..16].copy_from_slice(&chunk.through.to_le_bytes());
    out[16..].copy_from_slice(&chunk.checksum.to_le_bytes());
    out
}
