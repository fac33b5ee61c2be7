//! Tokenization.
//!
//! The engine only needs two capabilities, captured by the [`Tokenizer`]
//! trait: turning a prompt into token ids and turning one sampled id back
//! into bytes. [`BpeTokenizer`] implements them over a scored vocabulary.
//!
//! # Key Concepts
//!
//! ## Scored BPE
//!
//! Every vocabulary piece has a score. Encoding starts from one token per
//! code point (falling back to raw byte tokens for code points not in the
//! vocabulary) and repeatedly merges the adjacent pair whose concatenation
//! is in the vocabulary with the highest score.
//!
//! ## Vocabulary Layout
//!
//! ```text
//! 0        <unk>
//! 1        <s>     (BOS)
//! 2        </s>    (EOS)
//! 3..=258  <0x00> .. <0xFF>   byte fallback
//! 259..    merged pieces
//! ```
//!
//! ## File Format
//!
//! `i32 max_token_length`, then per piece `f32 score, i32 len, len bytes`,
//! all little-endian. The piece count is not stored; it must equal the
//! model's vocabulary size.

use std::collections::HashMap;
use std::path::Path;

use crate::{Error, Result};

/// A token ID.
pub type TokenId = u32;

/// Beginning-of-sequence token.
pub const BOS_ID: TokenId = 1;

/// End-of-sequence token.
pub const EOS_ID: TokenId = 2;

/// Id of the `<0x00>` byte-fallback piece.
pub const BYTE_FALLBACK_OFFSET: TokenId = 3;

/// Text <-> token capability used by generation.
pub trait Tokenizer: Send + Sync {
    /// Number of pieces.
    fn vocab_size(&self) -> usize;

    /// Encode text, optionally prefixed with BOS.
    fn encode(&self, text: &str, bos: bool) -> Result<Vec<TokenId>>;

    /// Bytes produced by `token` when it follows `prev`.
    ///
    /// Fragments may end mid code point; callers reassemble them.
    fn decode(&self, prev: TokenId, token: TokenId) -> Result<Vec<u8>>;
}

/// Scored BPE tokenizer.
///
/// # Examples
///
/// ```rust
/// use llama_engine::tokenizer::{BpeTokenizer, Tokenizer};
///
/// let tok = BpeTokenizer::byte_fallback(&[
///     (" ", 0.0),
///     ("h", 0.0),
///     ("i", 0.0),
///     (" h", 1.0),
///     (" hi", 2.0),
/// ])
/// .unwrap();
/// let ids = tok.encode("hi", true).unwrap();
/// assert_eq!(ids, vec![1, tok.token_id(b" hi").unwrap()]);
/// assert_eq!(tok.decode(1, ids[1]).unwrap(), b"hi");
/// ```
#[derive(Debug, Clone)]
pub struct BpeTokenizer {
    pieces: Vec<Vec<u8>>,
    scores: Vec<f32>,
    lookup: HashMap<Vec<u8>, TokenId>,
    max_token_length: usize,
}

impl BpeTokenizer {
    /// Build from `(piece, score)` pairs in id order.
    pub fn from_pieces(pieces: Vec<(Vec<u8>, f32)>) -> Result<Self> {
        if pieces.is_empty() {
            return Err(Error::tokenizer("empty vocabulary"));
        }
        TokenId::try_from(pieces.len())
            .map_err(|_| Error::tokenizer("vocabulary exceeds u32 ids"))?;

        let mut lookup = HashMap::with_capacity(pieces.len());
        let mut max_token_length = 0;
        let (pieces, scores): (Vec<Vec<u8>>, Vec<f32>) = pieces.into_iter().unzip();
        for (id, piece) in pieces.iter().enumerate() {
            max_token_length = max_token_length.max(piece.len());
            // First occurrence wins for duplicate pieces.
            lookup.entry(piece.clone()).or_insert(id as TokenId);
        }

        Ok(Self {
            pieces,
            scores,
            lookup,
            max_token_length,
        })
    }

    /// Standard specials and 256 byte pieces followed by `extra` pieces.
    pub fn byte_fallback(extra: &[(&str, f32)]) -> Result<Self> {
        let mut pieces: Vec<(Vec<u8>, f32)> = vec![
            (b"<unk>".to_vec(), 0.0),
            (b"<s>".to_vec(), 0.0),
            (b"</s>".to_vec(), 0.0),
        ];
        pieces.extend((0..=255u8).map(|b| (format!("<0x{b:02X}>").into_bytes(), 0.0)));
        pieces.extend(extra.iter().map(|&(p, s)| (p.as_bytes().to_vec(), s)));
        Self::from_pieces(pieces)
    }

    /// Load a tokenizer file holding exactly `vocab_size` pieces.
    pub fn load(path: impl AsRef<Path>, vocab_size: usize) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|e| Error::load_failure(format!("{}: {e}", path.display())))?;
        Self::from_bytes(&bytes, vocab_size)
    }

    /// Parse a tokenizer image holding exactly `vocab_size` pieces.
    pub fn from_bytes(bytes: &[u8], vocab_size: usize) -> Result<Self> {
        let mut cursor = bytes;
        let max_len = read_i32(&mut cursor, "max_token_length")?;
        let max_len = usize::try_from(max_len)
            .map_err(|_| Error::load_failure(format!("max_token_length = {max_len}")))?;

        let mut pieces = Vec::new();
        pieces.try_reserve_exact(vocab_size)?;
        for id in 0..vocab_size {
            let score = f32::from_bits(read_i32(&mut cursor, "score")? as u32);
            let len = read_i32(&mut cursor, "piece length")?;
            let len = usize::try_from(len)
                .ok()
                .filter(|&l| l <= max_len)
                .ok_or_else(|| Error::load_failure(format!("piece {id} has length {len}")))?;
            if cursor.len() < len {
                return Err(Error::load_failure(format!("tokenizer truncated in piece {id}")));
            }
            let (piece, rest) = cursor.split_at(len);
            pieces.push((piece.to_vec(), score));
            cursor = rest;
        }
        if !cursor.is_empty() {
            return Err(Error::load_failure(format!(
                "tokenizer has {} trailing bytes after {vocab_size} pieces",
                cursor.len()
            )));
        }

        let mut tok = Self::from_pieces(pieces).map_err(|e| Error::load_failure(e.to_string()))?;
        tok.max_token_length = max_len;
        Ok(tok)
    }

    /// Serialize to the tokenizer file format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.max_token_length as i32).to_le_bytes());
        for (piece, score) in self.pieces.iter().zip(&self.scores) {
            out.extend_from_slice(&score.to_le_bytes());
            out.extend_from_slice(&(piece.len() as i32).to_le_bytes());
            out.extend_from_slice(piece);
        }
        out
    }

    /// Longest piece in bytes.
    pub const fn max_token_length(&self) -> usize {
        self.max_token_length
    }

    /// Piece bytes for an id.
    pub fn piece(&self, id: TokenId) -> Option<&[u8]> {
        self.pieces.get(id as usize).map(Vec::as_slice)
    }

    /// Score for an id.
    pub fn score(&self, id: TokenId) -> Option<f32> {
        self.scores.get(id as usize).copied()
    }

    /// Id of an exact piece.
    pub fn token_id(&self, piece: &[u8]) -> Option<TokenId> {
        self.lookup.get(piece).copied()
    }

    fn byte_token(&self, byte: u8) -> Result<TokenId> {
        let id = BYTE_FALLBACK_OFFSET + TokenId::from(byte);
        if (id as usize) < self.pieces.len() {
            Ok(id)
        } else {
            Err(Error::tokenizer(format!("no byte fallback for 0x{byte:02X}")))
        }
    }

    /// Highest-scoring mergeable adjacent pair, first occurrence on ties.
    fn best_merge(&self, tokens: &[TokenId], buf: &mut Vec<u8>) -> Option<(usize, TokenId)> {
        let mut best: Option<(usize, TokenId, f32)> = None;
        for (i, pair) in tokens.windows(2).enumerate() {
            buf.clear();
            buf.extend_from_slice(&self.pieces[pair[0] as usize]);
            buf.extend_from_slice(&self.pieces[pair[1] as usize]);
            if let Some(&id) = self.lookup.get(buf.as_slice()) {
                let score = self.scores[id as usize];
                if best.map_or(true, |(_, _, s)| score > s) {
                    best = Some((i, id, score));
                }
            }
        }
        best.map(|(i, id, _)| (i, id))
    }
}

impl Tokenizer for BpeTokenizer {
    fn vocab_size(&self) -> usize {
        self.pieces.len()
    }

    fn encode(&self, text: &str, bos: bool) -> Result<Vec<TokenId>> {
        let mut tokens = Vec::with_capacity(text.len() + 2);

        if !text.is_empty() {
            if let Some(id) = self.token_id(b" ") {
                tokens.push(id);
            }
        }

        let mut utf8 = [0u8; 4];
        for c in text.chars() {
            let bytes = c.encode_utf8(&mut utf8).as_bytes();
            match self.token_id(bytes) {
                Some(id) => tokens.push(id),
                None => {
                    for &b in bytes {
                        tokens.push(self.byte_token(b)?);
                    }
                }
            }
        }

        let mut buf = Vec::with_capacity(self.max_token_length * 2);
        while let Some((i, id)) = self.best_merge(&tokens, &mut buf) {
            tokens[i] = id;
            tokens.remove(i + 1);
        }

        if bos {
            tokens.insert(0, BOS_ID);
        }
        Ok(tokens)
    }

    fn decode(&self, prev: TokenId, token: TokenId) -> Result<Vec<u8>> {
        let piece = self
            .piece(token)
            .ok_or_else(|| Error::tokenizer(format!("token {token} outside vocabulary")))?;

        let piece = if prev == BOS_ID {
            piece.strip_prefix(b" ").unwrap_or(piece)
        } else {
            piece
        };

        Ok(match parse_byte_piece(piece) {
            Some(byte) => vec![byte],
            None => piece.to_vec(),
        })
    }
}

/// Parse a `<0xXX>` byte piece.
fn parse_byte_piece(piece: &[u8]) -> Option<u8> {
    let hex = piece.strip_prefix(b"<0x")?.strip_suffix(b">")?;
    if hex.len() != 2 {
        return None;
    }
    u8::from_str_radix(std::str::from_utf8(hex).ok()?, 16).ok()
}

fn read_i32(cursor: &mut &[u8], what: &str) -> Result<i32> {
    if cursor.len() < 4 {
        return Err(Error::load_failure(format!("tokenizer truncated reading {what}")));
    }
    let (head, rest) = cursor.split_at(4);
    *cursor = rest;
    Ok(i32::from_le_bytes([head[0], head[1], head[2], head[3]]))
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_encode_decode_recovers_text(text in "[a-z é中\n]{0,24}") {
            let tok = BpeTokenizer::byte_fallback(&[(" ", 0.0), ("a", 0.0), ("b", 0.0), ("ab", 1.0), (" a", 2.0)]).unwrap();
            let ids = tok.encode(&text, true).unwrap();
            let mut bytes = Vec::new();
            for pair in ids.windows(2) {
                bytes.extend(tok.decode(pair[0], pair[1]).unwrap());
            }
            // The dummy prefix is the leading space stripped after BOS.
            prop_assert_eq!(String::from_utf8(bytes).unwrap(), text);
        }
    }
}
