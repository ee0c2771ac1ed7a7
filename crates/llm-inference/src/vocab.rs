//! Vocabulary read from the model file: byte pieces with scores.
//!
//! Encoding is greedy longest-match over raw bytes, which is enough for
//! driving the graph from text prompts. `▁` in a piece decodes to a space.

use std::collections::HashMap;

const SPACE_MARK: &str = "\u{2581}";

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub piece: Vec<u8>,
    pub score: f32,
}

#[derive(Debug, Clone, Default)]
pub struct Vocab {
    tokens: Vec<Token>,
    index: HashMap<Vec<u8>, usize>,
    max_piece_len: usize,
}

impl Vocab {
    pub fn new(tokens: impl IntoIterator<Item = Token>) -> Self {
        let mut vocab = Self::default();
        for token in tokens {
            vocab.push(token.piece, token.score);
        }
        vocab
    }

    /// Append a piece; the first occurrence wins for encoding.
    pub fn push(&mut self, piece: Vec<u8>, score: f32) -> usize {
        let id = self.tokens.len();
        self.max_piece_len = self.max_piece_len.max(piece.len());
        self.index.entry(piece.clone()).or_insert(id);
        self.tokens.push(Token { piece, score });
        id
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn token(&self, id: usize) -> Option<&Token> {
        self.tokens.get(id)
    }

    pub fn id_of(&self, piece: &[u8]) -> Option<usize> {
        self.index.get(piece).copied()
    }

    /// Greedy longest-match. Bytes no piece covers are skipped.
    pub fn encode(&self, text: &str) -> Vec<usize> {
        let bytes = text.as_bytes();
        let mut ids = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            let longest = (1..=self.max_piece_len.min(bytes.len() - pos))
                .rev()
                .find_map(|len| self.id_of(&bytes[pos..pos + len]).map(|id| (id, len)));
            match longest {
                Some((id, len)) => {
                    ids.push(id);
                    pos += len;
                }
                None => pos += 1,
            }
        }
        ids
    }

    pub fn decode(&self, ids: &[usize]) -> String {
        let bytes: Vec<u8> = ids
            .iter()
            .filter_map(|&id| self.token(id))
            .flat_map(|t| t.piece.iter().copied())
            .collect();
        String::from_utf8_lossy(&bytes).replace(SPACE_MARK, " ")
    }
}
