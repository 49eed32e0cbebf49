//! Byte Pair Encoding (BPE) Tokenizer
//!
//! The tokenizer that ships inside checkpoints. It is byte-level: the base
//! vocabulary holds one token per byte value, written as a hex string
//! (`<00>` … `<ff>`), and learned merge rules glue adjacent tokens into longer
//! ones. Any UTF-8 text encodes without unknown tokens, and decoding the full
//! id sequence reproduces the text byte for byte, which is what lets the
//! generation driver find the prompt again in the decoded output.
//!
//! Training merges is out of scope here; tokenizers arrive ready-made, either
//! embedded in a checkpoint or as a standalone JSON file.
//!
//! ## Encoding
//!
//! 1. Split the text into byte tokens
//! 2. Apply each merge rule in the order it was learned
//! 3. Look up the id of every resulting token
//!
//! Texts over 200KB are cut into ~100KB chunks at char boundaries and encoded
//! in parallel. Merges never cross a chunk boundary, which is harmless for the
//! essay-sized texts this crate feeds it.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::Result;

/// A byte-level BPE tokenizer
///
/// The serialized field layout is shared with the checkpoint format, so a
/// tokenizer saved alongside a model loads here unchanged.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BPETokenizer {
    /// Token string → id; always contains the 256 byte tokens
    vocab: HashMap<String, usize>,

    /// Merge rules in the order they were learned
    merges: Vec<(String, String)>,

    /// Carried for format compatibility; byte-level encoding never needs it
    #[allow(dead_code)]
    unk_token: String,
}

impl Default for BPETokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl BPETokenizer {
    /// Byte-only tokenizer: 256 tokens, no merges
    pub fn new() -> Self {
        let mut vocab = HashMap::new();
        for byte in 0..=255u8 {
            vocab.insert(byte_token(byte), vocab.len());
        }
        Self {
            vocab,
            merges: Vec::new(),
            unk_token: "<unk>".to_string(),
        }
    }

    /// Load a tokenizer from a JSON file
    ///
    /// Reads the format [`save`](Self::save) writes, which is also the format
    /// embedded in checkpoints.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the tokenizer JSON
    ///
    /// # Returns
    ///
    /// The tokenizer, or an I/O or JSON error if the file can't be read or
    /// parsed
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Save the tokenizer as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Number of tokens (256 + merges)
    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    pub fn num_merges(&self) -> usize {
        self.merges.len()
    }

    /// Encode text to token ids
    ///
    /// Converts the text to byte-level tokens, then applies the learned merge
    /// rules in the order they were learned.
    ///
    /// # Arguments
    ///
    /// * `text` - Input text to encode
    ///
    /// # Returns
    ///
    /// Vector of token ids; an empty text gives an empty vector
    ///
    /// # Performance
    ///
    /// Texts over 200KB are split into 100KB chunks (on character boundaries)
    /// and encoded in parallel with Rayon. A merge can't span a chunk boundary,
    /// so the token count of a very large text may differ slightly from a
    /// sequential encode.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use touchstone::tokenizer::BPETokenizer;
    /// let tokenizer = BPETokenizer::new();
    /// assert_eq!(tokenizer.encode("Hi"), vec![0x48, 0x69]);
    /// ```
    pub fn encode(&self, text: &str) -> Vec<usize> {
        const CHUNK_SIZE: usize = 100_000;

        if text.len() <= CHUNK_SIZE * 2 {
            return self.encode_chunk(text);
        }

        let mut chunks = Vec::new();
        let mut start = 0;
        while start < text.len() {
            let mut end = (start + CHUNK_SIZE).min(text.len());
            while end < text.len() && !text.is_char_boundary(end) {
                end += 1;
            }
            chunks.push(&text[start..end]);
            start = end;
        }

        chunks
            .par_iter()
            .map(|chunk| self.encode_chunk(chunk))
            .flatten()
            .collect()
    }

    fn encode_chunk(&self, text: &str) -> Vec<usize> {
        let mut tokens: Vec<String> = text.bytes().map(byte_token).collect();
        let mut merged_tokens = Vec::with_capacity(tokens.len());

        for (left, right) in &self.merges {
            if tokens.len() < 2 {
                break;
            }
            let merged = format!("{}{}", left, right);

            merged_tokens.clear();
            let mut i = 0;
            while i < tokens.len() {
                if i + 1 < tokens.len() && tokens[i] == *left && tokens[i + 1] == *right {
                    merged_tokens.push(merged.clone());
                    i += 2;
                } else {
                    merged_tokens.push(tokens[i].clone());
                    i += 1;
                }
            }
            std::mem::swap(&mut tokens, &mut merged_tokens);
        }

        tokens
            .iter()
            .map(|token| self.vocab.get(token).copied().unwrap_or(0))
            .collect()
    }

    /// Decode token ids back to text
    ///
    /// Maps each id back to its token, expands the token to its bytes and
    /// reassembles the string.
    ///
    /// # Arguments
    ///
    /// * `ids` - Token ids, as produced by [`encode`](Self::encode) or by
    ///   sampling from the model
    ///
    /// # Returns
    ///
    /// The decoded text. Unknown ids are skipped. Byte sequences that aren't
    /// valid UTF-8 (for example a multi-byte character cut in half) decode
    /// lossily, so `decode(encode(s)) == s` holds but a slice of the ids may
    /// not decode to a slice of `s`.
    pub fn decode(&self, ids: &[usize]) -> String {
        let id_to_token: HashMap<usize, &str> = self
            .vocab
            .iter()
            .map(|(token, &id)| (id, token.as_str()))
            .collect();

        let mut bytes = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(token) = id_to_token.get(id) {
                parse_hex_bytes(token, &mut bytes);
            }
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

fn byte_token(byte: u8) -> String {
    format!("<{:02x}>", byte)
}

/// Append the bytes of a `<xx><yy>…` token string to `out`
fn parse_hex_bytes(token: &str, out: &mut Vec<u8>) {
    for piece in token.split('<').filter(|p| !p.is_empty()) {
        let hex = piece.trim_end_matches('>');
        if let Ok(byte) = u8::from_str_radix(hex, 16) {
            out.push(byte);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_merges(merges: &[(&str, &str)]) -> BPETokenizer {
        let mut tokenizer = BPETokenizer::new();
        for (left, right) in merges {
            let merged = format!("{}{}", left, right);
            let id = tokenizer.vocab.len();
            tokenizer.vocab.insert(merged, id);
            tokenizer.merges.push((left.to_string(), right.to_string()));
        }
        tokenizer
    }

    #[test]
    fn test_base_vocab() {
        let tokenizer = BPETokenizer::new();
        assert_eq!(tokenizer.vocab_size(), 256);
        assert_eq!(tokenizer.num_merges(), 0);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let tokenizer = BPETokenizer::new();
        for text in [
            "hello",
            "Last Saturday, my friend annoyed me because he ",
            "newline\nand\ttab",
            "UTF-8: café, naïve, 日本語",
            "",
        ] {
            assert_eq!(tokenizer.decode(&tokenizer.encode(text)), text);
        }
    }

    #[test]
    fn test_merges_shorten_encoding() {
        // "l" + "l" -> 256, "he" -> 257
        let tokenizer = with_merges(&[("<6c>", "<6c>"), ("<68>", "<65>")]);
        let ids = tokenizer.encode("hello");
        assert_eq!(ids, vec![257, 256, 0x6f]);
        assert_eq!(tokenizer.decode(&ids), "hello");
    }

    #[test]
    fn test_unknown_ids_are_skipped() {
        let tokenizer = BPETokenizer::new();
        assert_eq!(tokenizer.decode(&[0x68, 9999, 0x69]), "hi");
    }

    #[test]
    fn test_json_roundtrip() {
        let tokenizer = with_merges(&[("<61>", "<62>")]);
        let json = serde_json::to_string(&tokenizer).unwrap();
        let loaded: BPETokenizer = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.vocab_size(), 257);
        assert_eq!(loaded.encode("ab"), vec![256]);
    }

    #[test]
    fn test_large_text_parallel_path() {
        let tokenizer = BPETokenizer::new();
        let text = "añb ".repeat(60_000);
        assert!(text.len() > 200_000);
        let ids = tokenizer.encode(&text);
        assert_eq!(ids.len(), text.len());
        assert_eq!(tokenizer.decode(&ids), text);
    }
}
