//! Stored documents and the fields the writer indexes.
//!
//! A [`Document`] is a set of named [`FieldValue`]s. Text fields are split on
//! Unicode word boundaries and lowercased, keyword fields index their whole
//! value as one term, token fields carry pre-analysed tokens (with optional
//! payloads), and integer and binary fields are stored only.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use unicode_segmentation::UnicodeSegmentation;

/// A pre-analysed token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    /// The term text.
    pub text: String,

    /// Distance from the previous token's position (default: 1).
    pub position_increment: u32,

    /// Optional bytes stored with this position.
    pub payload: Option<Vec<u8>>,
}

impl Token {
    /// Create a token with a position increment of 1 and no payload.
    pub fn new<S: Into<String>>(text: S) -> Self {
        Token {
            text: text.into(),
            position_increment: 1,
            payload: None,
        }
    }

    /// Attach a payload.
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Set the position increment.
    pub fn with_position_increment(mut self, increment: u32) -> Self {
        self.position_increment = increment;
        self
    }
}

/// The value of one document field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// Analysed text.
    Text(String),

    /// Indexed as a single term.
    Keyword(String),

    /// Pre-analysed tokens.
    Tokens(Vec<Token>),

    /// Stored only.
    Integer(i64),

    /// Stored only.
    Binary(Vec<u8>),
}

impl FieldValue {
    /// Whether the value produces terms.
    pub fn is_indexed(&self) -> bool {
        matches!(
            self,
            FieldValue::Text(_) | FieldValue::Keyword(_) | FieldValue::Tokens(_)
        )
    }

    /// The tokens this value contributes to the index.
    pub fn tokens(&self) -> Vec<Token> {
        match self {
            FieldValue::Text(text) => analyze(text),
            FieldValue::Keyword(value) => vec![Token::new(value.clone())],
            FieldValue::Tokens(tokens) => tokens.clone(),
            FieldValue::Integer(_) | FieldValue::Binary(_) => Vec::new(),
        }
    }

    /// Get the value as text, if it is textual.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) | FieldValue::Keyword(s) => Some(s),
            _ => None,
        }
    }

    /// Get the value as an integer.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(v) => Some(*v),
            _ => None,
        }
    }
}

/// Split text on Unicode word boundaries and lowercase each word.
pub fn analyze(text: &str) -> Vec<Token> {
    text.unicode_words()
        .map(|word| Token::new(word.to_lowercase()))
        .collect()
}

/// A document: named field values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    fields: HashMap<String, FieldValue>,
}

impl Document {
    /// Create a new empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder for constructing documents.
    pub fn builder() -> DocumentBuilder {
        DocumentBuilder::new()
    }

    /// Add a field value to the document.
    pub fn add_field<S: Into<String>>(&mut self, name: S, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }

    /// Get a field value from the document.
    pub fn get_field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Check if the document has a field.
    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Get all field values.
    pub fn fields(&self) -> &HashMap<String, FieldValue> {
        &self.fields
    }

    /// Get the number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Check if the document is empty.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A builder for constructing documents in a fluent manner.
#[derive(Debug, Default)]
pub struct DocumentBuilder {
    document: Document,
}

impl DocumentBuilder {
    /// Create a new document builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an analysed text field.
    pub fn add_text<S: Into<String>, T: Into<String>>(mut self, name: S, value: T) -> Self {
        self.document.add_field(name, FieldValue::Text(value.into()));
        self
    }

    /// Add a field indexed as one term.
    pub fn add_keyword<S: Into<String>, T: Into<String>>(mut self, name: S, value: T) -> Self {
        self.document
            .add_field(name, FieldValue::Keyword(value.into()));
        self
    }

    /// Add a field of pre-analysed tokens.
    pub fn add_tokens<S: Into<String>>(mut self, name: S, tokens: Vec<Token>) -> Self {
        self.document.add_field(name, FieldValue::Tokens(tokens));
        self
    }

    /// Add a stored integer field.
    pub fn add_integer<S: Into<String>>(mut self, name: S, value: i64) -> Self {
        self.document.add_field(name, FieldValue::Integer(value));
        self
    }

    /// Add a stored binary field.
    pub fn add_binary<S: Into<String>>(mut self, name: S, value: Vec<u8>) -> Self {
        self.document.add_field(name, FieldValue::Binary(value));
        self
    }

    /// Build the final document.
    pub fn build(self) -> Document {
        self.document
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analyze_lowercases_words() {
        let tokens = analyze("The Cat, the HAT!");
        let texts: Vec<&str> = tokens.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["the", "cat", "the", "hat"]);
    }

    #[test]
    fn test_builder() {
        let doc = Document::builder()
            .add_text("body", "Hello world")
            .add_keyword("id", "Doc-1")
            .add_integer("year", 2009)
            .build();

        assert_eq!(doc.len(), 3);
        assert_eq!(doc.get_field("id").unwrap().tokens()[0].text, "Doc-1");
        assert!(!doc.get_field("year").unwrap().is_indexed());
        assert_eq!(doc.get_field("year").unwrap().as_integer(), Some(2009));
    }

    #[test]
    fn test_bincode_round_trip() {
        let doc = Document::builder()
            .add_tokens("t", vec![Token::new("a").with_payload(vec![1, 2])])
            .add_binary("raw", vec![0, 255])
            .build();
        let bytes = bincode::serialize(&doc).unwrap();
        let decoded: Document = bincode::deserialize(&bytes).unwrap();
        assert_eq!(doc, decoded);
    }
}
