//! Terms: the unit of indexing.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A term is a word from a field. Terms order by field name, then by text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Term {
    field: String,
    text: String,
}

impl Term {
    /// Create a new term.
    pub fn new<F: Into<String>, T: Into<String>>(field: F, text: T) -> Self {
        Term {
            field: field.into(),
            text: text.into(),
        }
    }

    /// The field this term belongs to.
    pub fn field(&self) -> &str {
        &self.field
    }

    /// The term text.
    pub fn text(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.field, self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_is_field_then_text() {
        let mut terms = vec![
            Term::new("title", "apple"),
            Term::new("body", "zebra"),
            Term::new("body", "cat"),
        ];
        terms.sort();
        assert_eq!(terms[0], Term::new("body", "cat"));
        assert_eq!(terms[1], Term::new("body", "zebra"));
        assert_eq!(terms[2].to_string(), "title:apple");
    }
}
