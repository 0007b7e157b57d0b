use std::fmt;

use crate::error::ChefError;

/// Ingredient text as typed by the user, guaranteed non-blank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngredientQuery {
    text: String,
}

impl IngredientQuery {
    pub fn parse(raw: &str) -> Result<Self, ChefError> {
        let text = raw.trim();
        if text.is_empty() {
            return Err(ChefError::EmptyInput);
        }
        Ok(Self {
            text: text.to_string(),
        })
    }

    /// Trimmed text, embedded verbatim in the generation prompt.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Comma-separated entries, trimmed, blanks dropped.
    pub fn items(&self) -> Vec<String> {
        self.text
            .split([',', '，', '\n'])
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect()
    }
}

impl fmt::Display for IngredientQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}
