use crate::error::{ChefError, GENERATION_FAILED_MESSAGE};
use crate::recipes::{ImageRef, IngredientQuery, MealTime, Recipe, RecipeSet};

/// Proof that a generation was started at a given epoch.
///
/// Results carrying a ticket from an older epoch are discarded, so a slow
/// response can never overwrite the state of a newer generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GenerationTicket {
    epoch: u64,
}

impl GenerationTicket {
    pub fn epoch(self) -> u64 {
        self.epoch
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSlot {
    Loading,
    Ready(ImageRef),
}

impl ImageSlot {
    pub fn image(&self) -> Option<&ImageRef> {
        match self {
            ImageSlot::Loading => None,
            ImageSlot::Ready(image) => Some(image),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Generating {
        epoch: u64,
    },
    Ready {
        epoch: u64,
        recipes: RecipeSet,
        images: Vec<ImageSlot>,
    },
    Failed {
        epoch: u64,
        message: String,
    },
}

/// What the front end should render right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionView<'a> {
    Empty { generating: bool },
    Error { message: &'a str },
    Results { recipes: &'a RecipeSet, images: &'a [ImageSlot] },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipeSession {
    meal_time: MealTime,
    ingredients: String,
    epoch: u64,
    phase: Phase,
    detail: Option<usize>,
}

impl Default for RecipeSession {
    fn default() -> Self {
        Self::new()
    }
}

impl RecipeSession {
    pub fn new() -> Self {
        Self {
            meal_time: MealTime::default(),
            ingredients: String::new(),
            epoch: 0,
            phase: Phase::Idle,
            detail: None,
        }
    }

    pub fn meal_time(&self) -> MealTime {
        self.meal_time
    }

    pub fn set_meal_time(&mut self, meal_time: MealTime) {
        self.meal_time = meal_time;
    }

    pub fn set_ingredients(&mut self, text: impl Into<String>) {
        self.ingredients = text.into();
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn is_generating(&self) -> bool {
        matches!(self.phase, Phase::Generating { .. })
    }

    /// Validates the ingredient text and moves to `Generating`.
    ///
    /// Blank input returns [`ChefError::EmptyInput`] and leaves the session
    /// untouched. Otherwise earlier results, errors and the open detail view
    /// are cleared and a fresh epoch is issued.
    pub fn begin_generation(&mut self) -> Result<(GenerationTicket, IngredientQuery), ChefError> {
        let query = IngredientQuery::parse(&self.ingredients)?;
        self.epoch += 1;
        self.detail = None;
        self.phase = Phase::Generating { epoch: self.epoch };
        Ok((GenerationTicket { epoch: self.epoch }, query))
    }

    /// Applies a generation outcome. Returns `false` for a stale ticket.
    pub fn complete_generation(
        &mut self,
        ticket: GenerationTicket,
        result: Result<RecipeSet, ChefError>,
    ) -> bool {
        if !self.is_current(ticket) || !self.is_generating() {
            return false;
        }
        self.phase = match result {
            Ok(recipes) => Phase::Ready {
                epoch: ticket.epoch,
                images: vec![ImageSlot::Loading; recipes.len()],
                recipes,
            },
            Err(_) => Phase::Failed {
                epoch: ticket.epoch,
                message: GENERATION_FAILED_MESSAGE.to_string(),
            },
        };
        true
    }

    /// Attaches an image to the recipe at `index` of the ticket's generation.
    ///
    /// Returns `false` and changes nothing when the ticket is stale, the
    /// session is not showing results, or the index is out of range.
    pub fn attach_image(&mut self, ticket: GenerationTicket, index: usize, image: ImageRef) -> bool {
        if !self.is_current(ticket) {
            return false;
        }
        let Phase::Ready { images, .. } = &mut self.phase else {
            return false;
        };
        let Some(slot) = images.get_mut(index) else {
            return false;
        };
        *slot = ImageSlot::Ready(image);
        true
    }

    pub fn ticket(&self) -> Option<GenerationTicket> {
        match self.phase {
            Phase::Idle => None,
            _ => Some(GenerationTicket { epoch: self.epoch }),
        }
    }

    pub fn pending_images(&self) -> usize {
        match &self.phase {
            Phase::Ready { images, .. } => images
                .iter()
                .filter(|slot| matches!(slot, ImageSlot::Loading))
                .count(),
            _ => 0,
        }
    }

    pub fn recipes(&self) -> Option<&RecipeSet> {
        match &self.phase {
            Phase::Ready { recipes, .. } => Some(recipes),
            _ => None,
        }
    }

    /// Recipe at `index` with its image, once known, copied into `image_url`.
    pub fn recipe_with_image(&self, index: usize) -> Option<Recipe> {
        let Phase::Ready {
            recipes, images, ..
        } = &self.phase
        else {
            return None;
        };
        let mut recipe = recipes.get(index)?.clone();
        recipe.image_url = images
            .get(index)
            .and_then(ImageSlot::image)
            .map(ImageRef::to_uri);
        Some(recipe)
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.phase {
            Phase::Failed { message, .. } => Some(message),
            _ => None,
        }
    }

    pub fn view(&self) -> SessionView<'_> {
        match &self.phase {
            Phase::Idle => SessionView::Empty { generating: false },
            Phase::Generating { .. } => SessionView::Empty { generating: true },
            Phase::Failed { message, .. } => SessionView::Error { message },
            Phase::Ready {
                recipes, images, ..
            } => SessionView::Results { recipes, images },
        }
    }

    pub fn open_detail(&mut self, index: usize) -> bool {
        let exists = self
            .recipes()
            .map(|recipes| index < recipes.len())
            .unwrap_or(false);
        if exists {
            self.detail = Some(index);
        }
        exists
    }

    pub fn close_detail(&mut self) {
        self.detail = None;
    }

    pub fn detail(&self) -> Option<usize> {
        self.detail
    }

    fn is_current(&self, ticket: GenerationTicket) -> bool {
        ticket.epoch == self.epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipes::sample_recipe;

    fn recipe_set(prefix: &str) -> RecipeSet {
        RecipeSet::new(vec![
            sample_recipe(&format!("{prefix}-1")),
            sample_recipe(&format!("{prefix}-2")),
            sample_recipe(&format!("{prefix}-3")),
        ])
        .expect("valid set")
    }

    fn placeholder(url: &str) -> ImageRef {
        ImageRef::Placeholder {
            url: url.to_string(),
        }
    }

    #[test]
    fn blank_ingredients_do_not_start_a_generation() {
        let mut session = RecipeSession::new();
        session.set_ingredients("   ");
        assert_eq!(session.begin_generation().unwrap_err(), ChefError::EmptyInput);
        assert_eq!(session.epoch(), 0);
        assert_eq!(session.phase(), &Phase::Idle);
    }

    #[test]
    fn success_moves_to_results_with_loading_images() {
        let mut session = RecipeSession::new();
        session.set_ingredients("egg, onion, bacon");
        let (ticket, query) = session.begin_generation().expect("valid input");
        assert_eq!(query.items().len(), 3);
        assert!(matches!(session.view(), SessionView::Empty { generating: true }));

        assert!(session.complete_generation(ticket, Ok(recipe_set("a"))));
        assert_eq!(session.pending_images(), 3);
        match session.view() {
            SessionView::Results { recipes, images } => {
                assert_eq!(recipes.len(), 3);
                assert!(images.iter().all(|slot| *slot == ImageSlot::Loading));
            }
            other => panic!("unexpected view {other:?}"),
        }
    }

    #[test]
    fn failure_shows_single_error_and_no_results() {
        let mut session = RecipeSession::new();
        session.set_ingredients("egg");
        let (ticket, _) = session.begin_generation().expect("valid input");
        assert!(session.complete_generation(ticket, Err(ChefError::generation("boom"))));
        assert!(session.recipes().is_none());
        assert_eq!(session.error_message(), Some(GENERATION_FAILED_MESSAGE));
        assert!(matches!(session.view(), SessionView::Error { .. }));
    }

    #[test]
    fn new_generation_clears_previous_results_and_detail() {
        let mut session = RecipeSession::new();
        session.set_ingredients("egg");
        let (first, _) = session.begin_generation().expect("valid input");
        session.complete_generation(first, Ok(recipe_set("a")));
        assert!(session.open_detail(1));

        let (second, _) = session.begin_generation().expect("valid input");
        assert_ne!(first, second);
        assert!(session.recipes().is_none());
        assert_eq!(session.detail(), None);
    }

    #[test]
    fn stale_results_and_images_are_discarded() {
        let mut session = RecipeSession::new();
        session.set_ingredients("egg");
        let (first, _) = session.begin_generation().expect("valid input");
        session.complete_generation(first, Ok(recipe_set("old")));

        let (second, _) = session.begin_generation().expect("valid input");
        assert!(!session.attach_image(first, 0, placeholder("late")));
        assert!(!session.complete_generation(first, Ok(recipe_set("old"))));

        session.complete_generation(second, Ok(recipe_set("new")));
        assert!(!session.attach_image(first, 0, placeholder("late")));
        assert_eq!(session.pending_images(), 3);
        assert_eq!(session.recipes().map(RecipeSet::titles).unwrap_or_default()[0], "new-1");
    }

    #[test]
    fn images_land_on_their_own_index_in_any_order() {
        let mut session = RecipeSession::new();
        session.set_ingredients("egg");
        let (ticket, _) = session.begin_generation().expect("valid input");
        session.complete_generation(ticket, Ok(recipe_set("t")));

        assert!(session.attach_image(ticket, 2, placeholder("img-3")));
        assert!(session.attach_image(ticket, 0, placeholder("img-1")));
        assert!(!session.attach_image(ticket, 7, placeholder("nowhere")));

        assert_eq!(
            session.recipe_with_image(0).and_then(|recipe| recipe.image_url),
            Some("img-1".to_string())
        );
        assert_eq!(session.recipe_with_image(1).and_then(|recipe| recipe.image_url), None);
        assert_eq!(
            session.recipe_with_image(2).and_then(|recipe| recipe.image_url),
            Some("img-3".to_string())
        );
        assert_eq!(session.pending_images(), 1);
    }

    #[test]
    fn detail_view_only_opens_for_existing_recipes() {
        let mut session = RecipeSession::new();
        assert!(!session.open_detail(0));

        session.set_ingredients("egg");
        let (ticket, _) = session.begin_generation().expect("valid input");
        session.complete_generation(ticket, Ok(recipe_set("t")));
        assert!(!session.open_detail(3));
        assert!(session.open_detail(2));
        assert_eq!(session.detail(), Some(2));
        session.close_detail();
        assert_eq!(session.detail(), None);
    }
}
