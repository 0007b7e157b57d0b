use serde_json::{json, Map, Value};
use thiserror::Error;

use super::{Difficulty, Recipe, RecipeSet, RECIPES_PER_SET};

/// Basic seasonings that never count as missing ingredients.
pub const STAPLE_SEASONINGS: &[&str] = &[
    "소금",
    "설탕",
    "식용유",
    "salt",
    "sugar",
    "cooking oil",
    "vegetable oil",
];

const STRING_FIELDS: &[&str] = &[
    "title",
    "description",
    "cookingTime",
    "calories",
    "imagePrompt",
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaViolation {
    #[error("response is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("response is missing required field '{0}'")]
    MissingRoot(&'static str),

    #[error("expected {expected} recipes, got {actual}")]
    WrongCount { expected: usize, actual: usize },

    #[error("recipes[{index}] is not an object")]
    NotAnObject { index: usize },

    #[error("recipes[{index}] is missing required field '{field}'")]
    MissingField { index: usize, field: String },

    #[error("recipes[{index}].{field} must be a non-empty {expected}")]
    InvalidField {
        index: usize,
        field: String,
        expected: &'static str,
    },

    #[error("recipes[{index}].difficulty '{value}' is not one of 쉬움, 보통, 어려움")]
    InvalidDifficulty { index: usize, value: String },
}

/// Structured-output schema for the recipe request, in the provider's
/// OpenAPI subset (`OBJECT`, `ARRAY`, `STRING`).
pub fn recipe_response_schema() -> Value {
    let string_array = || json!({ "type": "ARRAY", "items": { "type": "STRING" } });
    let mut missing = string_array();
    if let Some(object) = missing.as_object_mut() {
        object.insert(
            "description".to_string(),
            Value::String("사용자에게 없는 추가 필요 재료".to_string()),
        );
    }

    json!({
        "type": "OBJECT",
        "properties": {
            "recipes": {
                "type": "ARRAY",
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        "title": { "type": "STRING" },
                        "description": { "type": "STRING" },
                        "ingredients": string_array(),
                        "missingIngredients": missing,
                        "instructions": string_array(),
                        "cookingTime": { "type": "STRING" },
                        "difficulty": { "type": "STRING", "enum": Difficulty::LABELS },
                        "calories": { "type": "STRING" },
                        "imagePrompt": {
                            "type": "STRING",
                            "description": "영어로 된 구체적인 요리 사진 묘사 프롬프트",
                        },
                    },
                    "required": required_recipe_fields(),
                },
            },
        },
        "required": ["recipes"],
    })
}

fn required_recipe_fields() -> Vec<&'static str> {
    vec![
        "title",
        "description",
        "ingredients",
        "missingIngredients",
        "instructions",
        "cookingTime",
        "difficulty",
        "calories",
        "imagePrompt",
    ]
}

/// Parses the model's JSON text into a validated [`RecipeSet`].
///
/// The provider is asked to honor [`recipe_response_schema`], but nothing here
/// assumes it did: presence, emptiness, enum membership and cardinality are all
/// checked before a typed value is produced. Staple seasonings are dropped from
/// `missingIngredients`.
pub fn parse_recipe_set(text: &str) -> Result<RecipeSet, SchemaViolation> {
    let root: Value = serde_json::from_str(text.trim())
        .map_err(|err| SchemaViolation::InvalidJson(err.to_string()))?;
    let rows = root
        .get("recipes")
        .and_then(Value::as_array)
        .ok_or(SchemaViolation::MissingRoot("recipes"))?;
    if rows.len() != RECIPES_PER_SET {
        return Err(SchemaViolation::WrongCount {
            expected: RECIPES_PER_SET,
            actual: rows.len(),
        });
    }

    let mut recipes = Vec::with_capacity(rows.len());
    for (index, row) in rows.iter().enumerate() {
        let object = row
            .as_object()
            .ok_or(SchemaViolation::NotAnObject { index })?;
        check_row(index, object)?;
        let mut recipe: Recipe = serde_json::from_value(row.clone())
            .map_err(|err| SchemaViolation::InvalidJson(format!("recipes[{index}]: {err}")))?;
        recipe.missing_ingredients = strip_staples(recipe.missing_ingredients);
        recipes.push(recipe);
    }

    RecipeSet::new(recipes)
}

fn check_row(index: usize, object: &Map<String, Value>) -> Result<(), SchemaViolation> {
    for field in required_recipe_fields() {
        if !object.contains_key(field) {
            return Err(SchemaViolation::MissingField {
                index,
                field: field.to_string(),
            });
        }
    }

    for field in STRING_FIELDS {
        let valid = object
            .get(*field)
            .and_then(Value::as_str)
            .map(|value| !value.trim().is_empty())
            .unwrap_or(false);
        if !valid {
            return Err(invalid_field(index, field, "string"));
        }
    }

    for (field, allow_empty) in [
        ("ingredients", false),
        ("missingIngredients", true),
        ("instructions", false),
    ] {
        let Some(items) = object.get(field).and_then(Value::as_array) else {
            return Err(invalid_field(index, field, "string array"));
        };
        let all_strings = items
            .iter()
            .all(|item| item.as_str().map(|text| !text.trim().is_empty()).unwrap_or(false));
        if !all_strings || (!allow_empty && items.is_empty()) {
            return Err(invalid_field(index, field, "string array"));
        }
    }

    let difficulty = object
        .get("difficulty")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if !Difficulty::LABELS.contains(&difficulty) {
        return Err(SchemaViolation::InvalidDifficulty {
            index,
            value: difficulty.to_string(),
        });
    }
    Ok(())
}

fn invalid_field(index: usize, field: &str, expected: &'static str) -> SchemaViolation {
    SchemaViolation::InvalidField {
        index,
        field: field.to_string(),
        expected,
    }
}

/// Same checks as [`parse_recipe_set`], applied to already-typed recipes.
pub(super) fn validate_recipes(recipes: &[Recipe]) -> Result<(), SchemaViolation> {
    if recipes.len() != RECIPES_PER_SET {
        return Err(SchemaViolation::WrongCount {
            expected: RECIPES_PER_SET,
            actual: recipes.len(),
        });
    }
    for (index, recipe) in recipes.iter().enumerate() {
        let strings = [
            ("title", &recipe.title),
            ("description", &recipe.description),
            ("cookingTime", &recipe.cooking_time),
            ("calories", &recipe.calories),
            ("imagePrompt", &recipe.image_prompt),
        ];
        for (field, value) in strings {
            if value.trim().is_empty() {
                return Err(invalid_field(index, field, "string"));
            }
        }
        let lists = [
            ("ingredients", &recipe.ingredients, false),
            ("missingIngredients", &recipe.missing_ingredients, true),
            ("instructions", &recipe.instructions, false),
        ];
        for (field, items, allow_empty) in lists {
            if (!allow_empty && items.is_empty()) || items.iter().any(|item| item.trim().is_empty())
            {
                return Err(invalid_field(index, field, "string array"));
            }
        }
    }
    Ok(())
}

fn strip_staples(items: Vec<String>) -> Vec<String> {
    items
        .into_iter()
        .filter(|item| {
            let normalized = item.trim().to_lowercase();
            !STAPLE_SEASONINGS.iter().any(|staple| *staple == normalized)
        })
        .collect()
}
