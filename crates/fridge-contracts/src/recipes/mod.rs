mod query;
mod schema;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ChefError;

pub use query::IngredientQuery;
pub use schema::{parse_recipe_set, recipe_response_schema, SchemaViolation, STAPLE_SEASONINGS};

/// Number of suggestions per generation. Not user-adjustable.
pub const RECIPES_PER_SET: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MealTime {
    #[serde(rename = "아침")]
    Breakfast,
    #[default]
    #[serde(rename = "점심")]
    Lunch,
    #[serde(rename = "저녁")]
    Dinner,
}

impl MealTime {
    pub fn label(self) -> &'static str {
        match self {
            MealTime::Breakfast => "아침",
            MealTime::Lunch => "점심",
            MealTime::Dinner => "저녁",
        }
    }
}

impl fmt::Display for MealTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for MealTime {
    type Err = ChefError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_lowercase();
        match normalized.as_str() {
            "아침" | "breakfast" | "morning" => Ok(MealTime::Breakfast),
            "점심" | "lunch" | "noon" => Ok(MealTime::Lunch),
            "저녁" | "dinner" | "evening" => Ok(MealTime::Dinner),
            _ => Err(ChefError::UnknownMealTime(raw.trim().to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Difficulty {
    #[serde(rename = "쉬움")]
    Easy,
    #[serde(rename = "보통")]
    Normal,
    #[serde(rename = "어려움")]
    Hard,
}

impl Difficulty {
    pub const LABELS: [&'static str; 3] = ["쉬움", "보통", "어려움"];

    pub fn label(self) -> &'static str {
        match self {
            Difficulty::Easy => "쉬움",
            Difficulty::Normal => "보통",
            Difficulty::Hard => "어려움",
        }
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipe {
    pub title: String,
    pub description: String,
    pub ingredients: Vec<String>,
    pub missing_ingredients: Vec<String>,
    pub instructions: Vec<String>,
    pub cooking_time: String,
    pub difficulty: Difficulty,
    pub calories: String,
    /// English description used for image synthesis.
    pub image_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

/// Exactly [`RECIPES_PER_SET`] recipes in provider order.
///
/// Only [`parse_recipe_set`] and [`RecipeSet::new`] build one, so a value of
/// this type has already passed validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RecipeSet {
    recipes: Vec<Recipe>,
}

impl RecipeSet {
    pub fn new(recipes: Vec<Recipe>) -> Result<Self, SchemaViolation> {
        schema::validate_recipes(&recipes)?;
        Ok(Self { recipes })
    }

    pub fn recipes(&self) -> &[Recipe] {
        &self.recipes
    }

    pub fn get(&self, index: usize) -> Option<&Recipe> {
        self.recipes.get(index)
    }

    pub fn len(&self) -> usize {
        self.recipes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipes.is_empty()
    }

    pub fn titles(&self) -> Vec<String> {
        self.recipes.iter().map(|recipe| recipe.title.clone()).collect()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Recipe> {
        self.recipes.iter()
    }
}

impl<'a> IntoIterator for &'a RecipeSet {
    type Item = &'a Recipe;
    type IntoIter = std::slice::Iter<'a, Recipe>;

    fn into_iter(self) -> Self::IntoIter {
        self.recipes.iter()
    }
}

/// Displayable image for a recipe card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageRef {
    /// Base64 image bytes returned inline by the provider.
    Inline { mime_type: String, data: String },
    Placeholder { url: String },
}

impl ImageRef {
    /// `data:` URI for inline images, the URL itself for placeholders.
    pub fn to_uri(&self) -> String {
        match self {
            ImageRef::Inline { mime_type, data } => format!("data:{mime_type};base64,{data}"),
            ImageRef::Placeholder { url } => url.clone(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, ImageRef::Placeholder { .. })
    }

    pub fn source(&self) -> &'static str {
        match self {
            ImageRef::Inline { .. } => "inline",
            ImageRef::Placeholder { .. } => "placeholder",
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_recipe(title: &str) -> Recipe {
    Recipe {
        title: title.to_string(),
        description: "든든한 한 끼".to_string(),
        ingredients: vec!["계란".to_string(), "양파".to_string()],
        missing_ingredients: vec!["대파".to_string()],
        instructions: vec!["양파를 볶는다".to_string(), "계란을 넣는다".to_string()],
        cooking_time: "15분".to_string(),
        difficulty: Difficulty::Easy,
        calories: "350kcal".to_string(),
        image_prompt: "fluffy omelette with onions".to_string(),
        image_url: None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn meal_time_parses_korean_and_english_names() {
        assert_eq!("아침".parse::<MealTime>(), Ok(MealTime::Breakfast));
        assert_eq!(" Lunch ".parse::<MealTime>(), Ok(MealTime::Lunch));
        assert_eq!("evening".parse::<MealTime>(), Ok(MealTime::Dinner));
        assert_eq!(
            "brunch".parse::<MealTime>(),
            Err(ChefError::UnknownMealTime("brunch".to_string()))
        );
        assert_eq!(MealTime::default(), MealTime::Lunch);
    }

    #[test]
    fn recipe_serializes_with_wire_field_names() -> anyhow::Result<()> {
        let value = serde_json::to_value(sample_recipe("계란 볶음"))?;
        assert_eq!(value["missingIngredients"], json!(["대파"]));
        assert_eq!(value["cookingTime"], json!("15분"));
        assert_eq!(value["difficulty"], json!("쉬움"));
        assert!(value.get("imageUrl").is_none());
        Ok(())
    }

    #[test]
    fn recipe_set_rejects_wrong_cardinality() {
        let two = vec![sample_recipe("a"), sample_recipe("b")];
        assert!(RecipeSet::new(two).is_err());

        let three = vec![sample_recipe("a"), sample_recipe("b"), sample_recipe("c")];
        let set = RecipeSet::new(three).expect("three recipes are valid");
        assert_eq!(set.titles(), vec!["a", "b", "c"]);
    }

    #[test]
    fn image_ref_renders_data_uri_and_placeholder() {
        let inline = ImageRef::Inline {
            mime_type: "image/png".to_string(),
            data: "AAAA".to_string(),
        };
        assert_eq!(inline.to_uri(), "data:image/png;base64,AAAA");
        assert_eq!(inline.source(), "inline");

        let placeholder = ImageRef::Placeholder {
            url: "https://picsum.photos/400/400".to_string(),
        };
        assert!(placeholder.is_placeholder());
        assert_eq!(placeholder.to_uri(), "https://picsum.photos/400/400");
    }
}
