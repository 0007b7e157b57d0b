use thiserror::Error;

/// Banner shown when recipe generation fails for any reason.
pub const GENERATION_FAILED_MESSAGE: &str =
    "레시피를 생성하는 중에 오류가 발생했습니다. 다시 시도해주세요.";

/// Prompt shown when the ingredient field is left blank.
pub const EMPTY_INPUT_MESSAGE: &str = "냉장고에 있는 재료를 입력해주세요!";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChefError {
    #[error("no ingredients were provided")]
    EmptyInput,

    #[error("recipe generation failed: {reason}")]
    Generation { reason: String },

    #[error("unknown meal time '{0}' (expected breakfast, lunch or dinner)")]
    UnknownMealTime(String),
}

impl ChefError {
    pub fn generation(reason: impl Into<String>) -> Self {
        Self::Generation {
            reason: reason.into(),
        }
    }

    /// Text for the user. Generation failures collapse to one retry prompt.
    pub fn user_message(&self) -> String {
        match self {
            Self::EmptyInput => EMPTY_INPUT_MESSAGE.to_string(),
            Self::Generation { .. } => GENERATION_FAILED_MESSAGE.to_string(),
            Self::UnknownMealTime(_) => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_failures_share_one_user_message() {
        let network = ChefError::generation("connection reset");
        let schema = ChefError::generation("recipes[1].difficulty invalid");
        assert_eq!(network.user_message(), GENERATION_FAILED_MESSAGE);
        assert_eq!(schema.user_message(), GENERATION_FAILED_MESSAGE);
        assert!(network.to_string().contains("connection reset"));
    }

    #[test]
    fn empty_input_prompts_to_fill_the_field() {
        assert_eq!(ChefError::EmptyInput.user_message(), EMPTY_INPUT_MESSAGE);
    }
}
