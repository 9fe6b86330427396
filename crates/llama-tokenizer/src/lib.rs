//! # llama-tokenizer
//!
//! Token-piece handling for llama-chat.
//!
//! This crate provides:
//! - [`DecodingState`]: streaming UTF-8 reassembly of raw token pieces
//! - A `Tokenizer` trait for vocabularies that hand out raw byte pieces
//! - [`ByteTokenizer`], a byte-level reference vocabulary for testing
//!
//! Pieces produced by BPE vocabularies are byte strings, and a multi-byte code
//! point can be split across two consecutive pieces. [`DecodingState`] holds an
//! incomplete trailing sequence back until the bytes that complete it arrive,
//! so streamed text never contains a spurious U+FFFD.

use encoding_rs::{CoderResult, Decoder, UTF_8};

/// Error type for tokenization operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenizerError {
    #[error("Invalid token ID: {0}")]
    InvalidToken(i32),
}

pub type TokenizerResult<T> = std::result::Result<T, TokenizerError>;

/// Core tokenizer trait. Implementations can be swapped without changing app code.
pub trait Tokenizer: Send + Sync {
    /// Encode text into a sequence of token IDs.
    fn encode(&self, text: &str, add_special: bool) -> Vec<i32>;

    /// Raw bytes of a single token.
    fn piece(&self, token: i32) -> TokenizerResult<&[u8]>;

    /// Decode a single token and accumulate it into the streaming state.
    /// Returns the text that became complete with this token.
    fn decode_token(&self, token: i32, state: &mut DecodingState) -> TokenizerResult<String> {
        let bytes = self.piece(token)?;
        Ok(state.push_bytes(bytes))
    }

    /// Get vocabulary size.
    fn vocab_size(&self) -> usize;
}

/// Streaming decoding state for handling partial UTF-8 sequences.
pub struct DecodingState {
    decoder: Decoder,
    buffer: String,
}

impl std::fmt::Debug for DecodingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodingState")
            .field("buffer", &self.buffer)
            .finish_non_exhaustive()
    }
}

impl Default for DecodingState {
    fn default() -> Self {
        Self::new()
    }
}

impl DecodingState {
    pub fn new() -> Self {
        Self {
            decoder: UTF_8.new_decoder_without_bom_handling(),
            buffer: String::new(),
        }
    }

    /// Everything decoded so far.
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Feed raw piece bytes. Returns the newly completed text, which is empty
    /// when `bytes` only extended an incomplete sequence.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> String {
        let out = decode_into(&mut self.decoder, bytes, false);
        self.buffer.push_str(&out);
        out
    }

    /// Flush the decoder. A dangling incomplete sequence becomes U+FFFD.
    pub fn finish(&mut self) -> String {
        let out = decode_into(&mut self.decoder, &[], true);
        self.buffer.push_str(&out);
        self.decoder = UTF_8.new_decoder_without_bom_handling();
        out
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.decoder = UTF_8.new_decoder_without_bom_handling();
    }
}

fn decode_into(decoder: &mut Decoder, mut src: &[u8], last: bool) -> String {
    let mut out = String::new();
    loop {
        let needed = decoder
            .max_utf8_buffer_length(src.len())
            .unwrap_or(src.len() + 4);
        out.reserve(needed.max(4));
        let (result, read, _) = decoder.decode_to_string(src, &mut out, last);
        src = &src[read..];
        match result {
            CoderResult::InputEmpty => return out,
            CoderResult::OutputFull => continue,
        }
    }
}

/// Beginning-of-sequence token of [`ByteTokenizer`].
pub const BYTE_BOS: i32 = 256;
/// End-of-generation token of [`ByteTokenizer`].
pub const BYTE_EOG: i32 = 257;
const FIRST_PIECE: i32 = 258;

/// Reference byte-level vocabulary.
///
/// - ids `0..=255` are single bytes
/// - [`BYTE_BOS`] renders as nothing, [`BYTE_EOG`] as its end marker text
/// - extra multi-byte pieces can be registered and get ids from 258 upward
/// - encoding never produces extra pieces, so it is deterministic and lossless
#[derive(Debug, Clone)]
pub struct ByteTokenizer {
    eog_text: Vec<u8>,
    pieces: Vec<Vec<u8>>,
}

impl ByteTokenizer {
    pub fn new(eog_text: &str) -> Self {
        Self {
            eog_text: eog_text.as_bytes().to_vec(),
            pieces: Vec::new(),
        }
    }

    /// Register a multi-byte piece, returning its id. Registering the same
    /// bytes twice returns the existing id.
    pub fn add_piece(&mut self, bytes: &[u8]) -> i32 {
        if let [b] = bytes {
            return i32::from(*b);
        }
        if let Some(idx) = self.pieces.iter().position(|p| p == bytes) {
            return FIRST_PIECE + idx as i32;
        }
        self.pieces.push(bytes.to_vec());
        FIRST_PIECE + (self.pieces.len() as i32 - 1)
    }

    pub fn is_eog(&self, token: i32) -> bool {
        token == BYTE_EOG
    }
}

impl Default for ByteTokenizer {
    fn default() -> Self {
        Self::new("</s>")
    }
}

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str, add_special: bool) -> Vec<i32> {
        let mut ids = Vec::with_capacity(text.len() + 1);
        if add_special {
            ids.push(BYTE_BOS);
        }
        ids.extend(text.bytes().map(i32::from));
        ids
    }

    fn piece(&self, token: i32) -> TokenizerResult<&[u8]> {
        match token {
            0..=255 => Ok(&BYTE_TABLE[token as usize..token as usize + 1]),
            BYTE_BOS => Ok(&[] as &[u8]),
            BYTE_EOG => Ok(self.eog_text.as_slice()),
            t if t >= FIRST_PIECE => self
                .pieces
                .get((t - FIRST_PIECE) as usize)
                .map(Vec::as_slice)
                .ok_or(TokenizerError::InvalidToken(t)),
            t => Err(TokenizerError::InvalidToken(t)),
        }
    }

    fn vocab_size(&self) -> usize {
        FIRST_PIECE as usize + self.pieces.len()
    }
}

static BYTE_TABLE: [u8; 256] = {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = i as u8;
        i += 1;
    }
    table
};
