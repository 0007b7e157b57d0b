use std::collections::BTreeMap;
use std::env;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use fridge_contracts::events::{EventPayload, EventWriter};
use fridge_contracts::models::{Capability, ModelSelector, ModelSpec};
use fridge_contracts::recipes::{
    parse_recipe_set, recipe_response_schema, ImageRef, IngredientQuery, MealTime, RecipeSet,
    RECIPES_PER_SET,
};
use fridge_contracts::session::{GenerationTicket, RecipeSession};
use fridge_contracts::ChefError;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use url::Url;

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const GENERIC_PLACEHOLDER_URL: &str = "https://picsum.photos/400/400";

const PLACEHOLDER_BASE: &str = "https://picsum.photos";
const PLACEHOLDER_EDGE: &str = "400";
const IMAGE_ASPECT_RATIO: &str = "1:1";
const DEFAULT_IMAGE_MIME: &str = "image/png";
const DEFAULT_REQUEST_TIMEOUT_S: f64 = 90.0;
const INGREDIENTS_LINE_PREFIX: &str = "냉장고 재료: ";

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub api_key: Option<String>,
    pub api_base: String,
    pub text_model: Option<String>,
    pub image_model: Option<String>,
    pub request_timeout_s: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: DEFAULT_API_BASE.to_string(),
            text_model: None,
            image_model: None,
            request_timeout_s: DEFAULT_REQUEST_TIMEOUT_S,
        }
    }
}

impl EngineConfig {
    /// Reads `GEMINI_API_KEY` (then `GOOGLE_API_KEY`, then `API_KEY`),
    /// `GEMINI_API_BASE`, `FRIDGE_TEXT_MODEL`, `FRIDGE_IMAGE_MODEL` and
    /// `FRIDGE_REQUEST_TIMEOUT`. A missing key is not an error here; calls that
    /// need it fail later like any other upstream error.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        Self {
            api_key: get("GEMINI_API_KEY")
                .or_else(|| get("GOOGLE_API_KEY"))
                .or_else(|| get("API_KEY")),
            api_base: get("GEMINI_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            text_model: get("FRIDGE_TEXT_MODEL"),
            image_model: get("FRIDGE_IMAGE_MODEL"),
            request_timeout_s: get("FRIDGE_REQUEST_TIMEOUT")
                .and_then(|value| value.parse::<f64>().ok())
                .map(clamp_timeout)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_S),
        }
    }
}

/// Request timeout in seconds, kept within 5..=300. Non-finite values get the default.
fn clamp_timeout(seconds: f64) -> f64 {
    if seconds.is_finite() {
        seconds.clamp(5.0, 300.0)
    } else {
        DEFAULT_REQUEST_TIMEOUT_S
    }
}

/// One `generateContent` round trip. Implementations make exactly one
/// upstream call per invocation and never retry.
pub trait ContentProvider: Send + Sync {
    fn name(&self) -> &str;
    fn generate_content(&self, model: &str, payload: &Value) -> Result<Value>;
}

#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn ContentProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: ContentProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Arc::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ContentProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

pub fn default_provider_registry(config: &EngineConfig) -> ProviderRegistry {
    let mut providers = ProviderRegistry::new();
    providers.register(DryrunProvider);
    providers.register(GeminiProvider::new(config));
    providers
}

pub struct GeminiProvider {
    api_base: String,
    api_key: Option<String>,
    timeout: Duration,
    http: HttpClient,
}

impl GeminiProvider {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            api_base: config.api_base.clone(),
            api_key: config.api_key.clone(),
            timeout: Duration::from_secs_f64(clamp_timeout(config.request_timeout_s)),
            http: HttpClient::new(),
        }
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }
}

impl ContentProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate_content(&self, model: &str, payload: &Value) -> Result<Value> {
        let Some(api_key) = self.api_key.as_deref() else {
            bail!("GEMINI_API_KEY or GOOGLE_API_KEY or API_KEY not set");
        };
        let endpoint = self.endpoint_for_model(model);
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", api_key)])
            .timeout(self.timeout)
            .json(payload)
            .send()
            .with_context(|| format!("Gemini request failed ({endpoint})"))?;
        response_json_or_error("Gemini", response)
    }
}

/// Offline provider with deterministic output, for running without a key.
pub struct DryrunProvider;

impl DryrunProvider {
    fn recipes_for(prompt: &str) -> Value {
        let items: Vec<String> = prompt
            .lines()
            .find_map(|line| line.trim().strip_prefix(INGREDIENTS_LINE_PREFIX))
            .and_then(|text| IngredientQuery::parse(text).ok())
            .map(|query| query.items())
            .filter(|items| !items.is_empty())
            .unwrap_or_else(|| vec!["계란".to_string()]);

        let styles = [
            ("볶음", "쉬움", "15분", "380kcal", "대파", "stir-fried"),
            ("수프", "보통", "30분", "260kcal", "우유", "creamy soup"),
            ("그라탕", "어려움", "45분", "540kcal", "모짜렐라 치즈", "baked gratin"),
        ];
        let recipes: Vec<Value> = styles
            .iter()
            .enumerate()
            .map(|(idx, (dish, difficulty, time, calories, missing, english))| {
                let lead = &items[idx % items.len()];
                json!({
                    "title": format!("{lead} {dish}"),
                    "description": format!("{lead}을(를) 중심으로 만든 간단한 {dish}"),
                    "ingredients": items,
                    "missingIngredients": [missing],
                    "instructions": [
                        format!("{}을(를) 손질합니다.", items.join(", ")),
                        format!("{lead}을(를) 중심으로 {dish}을(를) 만듭니다."),
                        "그릇에 담아 완성합니다.",
                    ],
                    "cookingTime": time,
                    "difficulty": difficulty,
                    "calories": calories,
                    "imagePrompt": format!("{english} made with {}", items.join(", ")),
                })
            })
            .collect();
        json!({ "recipes": recipes })
    }

    fn image_for(prompt: &str) -> Result<Value> {
        let (r, g, b) = color_from_prompt(prompt);
        let image = RgbImage::from_pixel(64, 64, Rgb([r, g, b]));
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(image)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .context("dryrun image encode failed")?;
        Ok(json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [{
                        "inlineData": {
                            "mimeType": DEFAULT_IMAGE_MIME,
                            "data": BASE64.encode(bytes),
                        }
                    }]
                },
                "finishReason": "STOP",
            }]
        }))
    }
}

impl ContentProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate_content(&self, _model: &str, payload: &Value) -> Result<Value> {
        let prompt = payload_prompt_text(payload);
        let wants_image = payload
            .pointer("/generationConfig/responseModalities")
            .and_then(Value::as_array)
            .map(|modalities| modalities.iter().any(|value| value == "IMAGE"))
            .unwrap_or(false);
        if wants_image {
            return Self::image_for(&prompt);
        }
        let text = serde_json::to_string(&Self::recipes_for(&prompt))?;
        Ok(json!({
            "candidates": [{
                "content": { "role": "model", "parts": [{ "text": text }] },
                "finishReason": "STOP",
            }]
        }))
    }
}

/// Structured-output request for exactly three recipes.
#[derive(Clone)]
pub struct RecipeGenerator {
    provider: Arc<dyn ContentProvider>,
    model: String,
    events: EventWriter,
}

impl RecipeGenerator {
    pub fn new(provider: Arc<dyn ContentProvider>, model: impl Into<String>, events: EventWriter) -> Self {
        Self {
            provider,
            model: model.into(),
            events,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Issues one request and validates the reply. Every failure, from
    /// transport to schema, comes back as [`ChefError::Generation`].
    pub fn generate(&self, meal_time: MealTime, query: &IngredientQuery) -> Result<RecipeSet, ChefError> {
        log_event(
            &self.events,
            "generation_started",
            json!({
                "meal_time": meal_time.label(),
                "ingredients": query.as_str(),
                "provider": self.provider.name(),
                "model": self.model,
            }),
        );
        let started = Instant::now();
        match self.request(meal_time, query) {
            Ok(recipes) => {
                log_event(
                    &self.events,
                    "recipes_ready",
                    json!({
                        "titles": recipes.titles(),
                        "model": self.model,
                        "latency_s": started.elapsed().as_secs_f64(),
                    }),
                );
                Ok(recipes)
            }
            Err(err) => {
                let reason = error_chain_text(&err, 1024);
                log_event(
                    &self.events,
                    "generation_failed",
                    json!({ "model": self.model, "error": reason }),
                );
                Err(ChefError::generation(reason))
            }
        }
    }

    fn request(&self, meal_time: MealTime, query: &IngredientQuery) -> Result<RecipeSet> {
        let payload = build_recipe_payload(meal_time, query);
        let response = self
            .provider
            .generate_content(&self.model, &payload)
            .context("recipe request failed")?;
        let text = response_text(&response)?;
        parse_recipe_set(&text).context("recipe response did not match the schema")
    }
}

pub fn build_recipe_prompt(meal_time: MealTime, query: &IngredientQuery) -> String {
    let meal = meal_time.label();
    format!(
        "식사 시간: {meal}\n\
         {INGREDIENTS_LINE_PREFIX}{ingredients}\n\
         이 조건에 맞는 맛있는 한국식 또는 퓨전 요리 레시피 {count}가지를 제안해주세요.\n\
         \n\
         중요 지침:\n\
         1. 사용자가 입력한 재료를 최대한 활용하세요.\n\
         2. 'ingredients' 필드에는 사용자가 이미 가지고 있는 재료 중 요리에 쓰이는 것들을 넣으세요.\n\
         3. 'missingIngredients' 필드에는 요리를 완성하기 위해 추가로 필요하지만 사용자의 입력에는 없었던 재료들을 상세히 나열하세요. (소금, 설탕, 식용유 같은 기본 양념 제외)\n\
         4. {meal} 식사에 어울리는 요리를 우선으로 제안하세요.\n\
         5. 한국어로 답변하세요. 단, 'imagePrompt'는 영어로 된 구체적인 요리 사진 묘사로 작성하세요.",
        ingredients = query.as_str(),
        count = RECIPES_PER_SET,
    )
}

pub fn build_recipe_payload(meal_time: MealTime, query: &IngredientQuery) -> Value {
    json!({
        "contents": [{
            "role": "user",
            "parts": [{ "text": build_recipe_prompt(meal_time, query) }],
        }],
        "generationConfig": {
            "responseMimeType": "application/json",
            "responseSchema": recipe_response_schema(),
        },
    })
}

/// Concatenated text parts of the first candidate.
fn response_text(response: &Value) -> Result<String> {
    let Some(candidate) = response
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
    else {
        if let Some(reason) = response
            .pointer("/promptFeedback/blockReason")
            .and_then(Value::as_str)
        {
            bail!("prompt blocked by provider ({reason})");
        }
        bail!("provider returned no candidates");
    };

    let text: String = candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();
    if text.trim().is_empty() {
        let finish = candidate
            .get("finishReason")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        bail!("provider returned no text (finishReason: {finish})");
    }
    Ok(text)
}

/// Single square image per call; never fails outward.
#[derive(Clone)]
pub struct ImageGenerator {
    provider: Arc<dyn ContentProvider>,
    model: String,
    events: EventWriter,
}

impl ImageGenerator {
    pub fn new(provider: Arc<dyn ContentProvider>, model: impl Into<String>, events: EventWriter) -> Self {
        Self {
            provider,
            model: model.into(),
            events,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Returns the provider's inline image, or the placeholder seeded by
    /// `seed` when the call fails or carries no image.
    pub fn generate_image(&self, prompt: &str, seed: &str) -> ImageRef {
        log_event(
            &self.events,
            "image_requested",
            json!({ "prompt_id": short_id(prompt), "model": self.model }),
        );
        let payload = build_image_payload(prompt);
        let failure = match self.provider.generate_content(&self.model, &payload) {
            Ok(response) => match extract_inline_image(&response) {
                Some(image) => return image,
                None => "response contained no inline image part".to_string(),
            },
            Err(err) => error_chain_text(&err, 512),
        };

        let fallback = placeholder_image(seed);
        log_event(
            &self.events,
            "image_fallback",
            json!({
                "prompt_id": short_id(prompt),
                "reason": failure,
                "url": fallback.to_uri(),
            }),
        );
        fallback
    }
}

pub fn build_image_prompt(prompt: &str) -> String {
    format!(
        "Professional food photography of {prompt}, appetizing, high resolution, 4k, soft natural lighting, top-down view."
    )
}

pub fn build_image_payload(prompt: &str) -> Value {
    json!({
        "contents": [{
            "role": "user",
            "parts": [{ "text": build_image_prompt(prompt) }],
        }],
        "generationConfig": {
            "responseModalities": ["IMAGE"],
            "imageConfig": { "aspectRatio": IMAGE_ASPECT_RATIO },
        },
    })
}

/// First inline part whose data decodes as base64, across all candidates.
pub fn extract_inline_image(response: &Value) -> Option<ImageRef> {
    let candidates = response.get("candidates").and_then(Value::as_array)?;
    candidates
        .iter()
        .filter_map(|candidate| candidate.pointer("/content/parts").and_then(Value::as_array))
        .flatten()
        .filter_map(|part| {
            part.get("inlineData")
                .or_else(|| part.get("inline_data"))
                .and_then(Value::as_object)
        })
        .find_map(|inline| {
            let data = inline.get("data").and_then(Value::as_str)?.trim();
            if data.is_empty() || BASE64.decode(data.as_bytes()).is_err() {
                return None;
            }
            let mime_type = inline
                .get("mimeType")
                .or_else(|| inline.get("mime_type"))
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| value.starts_with("image/"))
                .unwrap_or(DEFAULT_IMAGE_MIME);
            Some(ImageRef::Inline {
                mime_type: mime_type.to_string(),
                data: data.to_string(),
            })
        })
}

/// Seeded placeholder for `seed`, or the generic one when no seeded URL can be built.
pub fn placeholder_image(seed: &str) -> ImageRef {
    ImageRef::Placeholder {
        url: seeded_placeholder_url(seed).unwrap_or_else(|| GENERIC_PLACEHOLDER_URL.to_string()),
    }
}

fn seeded_placeholder_url(seed: &str) -> Option<String> {
    let seed = seed.trim();
    if seed.is_empty() {
        return None;
    }
    let mut url = Url::parse(PLACEHOLDER_BASE).ok()?;
    {
        let mut segments = url.path_segments_mut().ok()?;
        segments
            .clear()
            .extend(["seed", seed, PLACEHOLDER_EDGE, PLACEHOLDER_EDGE]);
    }
    Some(url.to_string())
}

/// Image for one recipe, tagged with the generation it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDelivery {
    pub ticket: GenerationTicket,
    pub index: usize,
    pub title: String,
    pub image: ImageRef,
}

#[derive(Debug, Clone)]
struct EffectiveSelection {
    model: ModelSpec,
    fallback_reason: Option<String>,
}

pub struct ChefEngine {
    events: EventWriter,
    model_selector: ModelSelector,
    providers: ProviderRegistry,
    text_model: Option<String>,
    image_model: Option<String>,
    fallback_reasons: BTreeMap<Capability, String>,
}

impl ChefEngine {
    pub fn new(config: &EngineConfig, events_path: Option<PathBuf>) -> Result<Self> {
        let session_id = format!("session-{}", uuid::Uuid::new_v4());
        let events = match events_path {
            Some(path) => EventWriter::new(path, session_id),
            None => EventWriter::disabled(session_id),
        };
        Self::with_providers(config, events, default_provider_registry(config))
    }

    pub fn with_providers(
        config: &EngineConfig,
        events: EventWriter,
        providers: ProviderRegistry,
    ) -> Result<Self> {
        events.emit(
            "session_started",
            map_object(json!({
                "providers": providers.names(),
                "text_model": config.text_model,
                "image_model": config.image_model,
            })),
        )?;
        Ok(Self {
            events,
            model_selector: ModelSelector::default(),
            providers,
            text_model: config.text_model.clone(),
            image_model: config.image_model.clone(),
            fallback_reasons: BTreeMap::new(),
        })
    }

    pub fn set_text_model(&mut self, model: Option<String>) {
        self.text_model = model;
    }

    pub fn text_model(&self) -> Option<&str> {
        self.text_model.as_deref()
    }

    pub fn set_image_model(&mut self, model: Option<String>) {
        self.image_model = model;
    }

    pub fn image_model(&self) -> Option<&str> {
        self.image_model.as_deref()
    }

    /// Why the last resolution for `capability` did not use the requested model.
    pub fn fallback_reason(&self, capability: Capability) -> Option<&str> {
        self.fallback_reasons.get(&capability).map(String::as_str)
    }

    /// Substitution notes for every capability, text before image.
    pub fn fallback_reasons(&self) -> Vec<&str> {
        self.fallback_reasons.values().map(String::as_str).collect()
    }

    pub fn recipe_generator(&mut self) -> Result<RecipeGenerator> {
        let requested = self.text_model.clone();
        let (provider, model) = self.resolve(requested.as_deref(), Capability::Text)?;
        Ok(RecipeGenerator::new(provider, model, self.events.clone()))
    }

    pub fn image_generator(&mut self) -> Result<ImageGenerator> {
        let requested = self.image_model.clone();
        let (provider, model) = self.resolve(requested.as_deref(), Capability::Image)?;
        Ok(ImageGenerator::new(provider, model, self.events.clone()))
    }

    pub fn generate_recipes(
        &mut self,
        meal_time: MealTime,
        query: &IngredientQuery,
    ) -> Result<RecipeSet, ChefError> {
        let generator = self
            .recipe_generator()
            .map_err(|err| ChefError::generation(error_chain_text(&err, 1024)))?;
        generator.generate(meal_time, query)
    }

    pub fn generate_image(&mut self, prompt: &str, seed: &str) -> ImageRef {
        match self.image_generator() {
            Ok(generator) => generator.generate_image(prompt, seed),
            Err(err) => {
                let fallback = placeholder_image(seed);
                log_event(
                    &self.events,
                    "image_fallback",
                    json!({
                        "prompt_id": short_id(prompt),
                        "reason": error_chain_text(&err, 512),
                        "url": fallback.to_uri(),
                    }),
                );
                fallback
            }
        }
    }

    /// Validates input, generates, and applies the outcome to `session`.
    ///
    /// `EmptyInput` is returned before any provider call. On failure the
    /// session is left in its error state and the error is returned as well.
    pub fn run_generation(
        &mut self,
        session: &mut RecipeSession,
    ) -> Result<GenerationTicket, ChefError> {
        let (ticket, query) = session.begin_generation()?;
        let result = self.generate_recipes(session.meal_time(), &query);
        let outcome = result.as_ref().map(|_| ()).map_err(Clone::clone);
        session.complete_generation(ticket, result);
        log_event(
            &self.events,
            "session_phase",
            json!({
                "epoch": ticket.epoch(),
                "phase": if outcome.is_ok() { "results" } else { "error" },
            }),
        );
        outcome.map(|()| ticket)
    }

    /// Starts one worker per recipe. Deliveries arrive on `tx` in completion
    /// order, each tagged with `ticket` and its recipe index.
    pub fn spawn_image_jobs(
        &mut self,
        ticket: GenerationTicket,
        recipes: &RecipeSet,
        tx: Sender<ImageDelivery>,
    ) -> Vec<JoinHandle<()>> {
        let generator = match self.image_generator() {
            Ok(generator) => Some(generator),
            Err(err) => {
                log_event(
                    &self.events,
                    "image_fallback",
                    json!({
                        "epoch": ticket.epoch(),
                        "reason": error_chain_text(&err, 512),
                    }),
                );
                None
            }
        };

        recipes
            .iter()
            .enumerate()
            .map(|(index, recipe)| {
                let generator = generator.clone();
                let tx = tx.clone();
                let prompt = recipe.image_prompt.clone();
                let title = recipe.title.clone();
                thread::spawn(move || {
                    let image = match generator {
                        Some(generator) => generator.generate_image(&prompt, &title),
                        None => placeholder_image(&title),
                    };
                    // The receiver may already have moved on to a newer generation.
                    let _ = tx.send(ImageDelivery {
                        ticket,
                        index,
                        title,
                        image,
                    });
                })
            })
            .collect()
    }

    /// Applies a delivery to `session`; stale or out-of-range ones are logged and dropped.
    pub fn apply_delivery(&self, session: &mut RecipeSession, delivery: ImageDelivery) -> bool {
        let source = delivery.image.source();
        let attached = session.attach_image(delivery.ticket, delivery.index, delivery.image);
        let event_type = if attached {
            "image_ready"
        } else {
            "image_discarded"
        };
        log_event(
            &self.events,
            event_type,
            json!({
                "epoch": delivery.ticket.epoch(),
                "current_epoch": session.epoch(),
                "index": delivery.index,
                "title": delivery.title,
                "source": source,
            }),
        );
        attached
    }

    /// Fetches every image of the session's current results concurrently and
    /// blocks until all are attached. Returns the number attached.
    pub fn fill_images(&mut self, session: &mut RecipeSession) -> usize {
        let (Some(ticket), Some(recipes)) = (session.ticket(), session.recipes().cloned()) else {
            return 0;
        };
        let (tx, rx) = mpsc::channel();
        let handles = self.spawn_image_jobs(ticket, &recipes, tx);
        let mut attached = 0;
        for delivery in rx {
            if self.apply_delivery(session, delivery) {
                attached += 1;
            }
        }
        for (index, handle) in handles.into_iter().enumerate() {
            if handle.join().is_err() {
                log_event(
                    &self.events,
                    "image_discarded",
                    json!({
                        "epoch": ticket.epoch(),
                        "index": index,
                        "reason": "image worker panicked",
                    }),
                );
            }
        }
        attached
    }

    pub fn finish(&self) -> Result<()> {
        self.events.emit("session_finished", EventPayload::new())?;
        Ok(())
    }

    fn resolve(
        &mut self,
        requested: Option<&str>,
        capability: Capability,
    ) -> Result<(Arc<dyn ContentProvider>, String)> {
        let selection = self.select_model(requested, capability)?;
        match selection.fallback_reason {
            Some(reason) => {
                self.fallback_reasons.insert(capability, reason);
            }
            None => {
                self.fallback_reasons.remove(&capability);
            }
        }
        let Some(provider) = self.providers.get(&selection.model.provider) else {
            bail!(
                "provider '{}' not registered (available: [{}])",
                selection.model.provider,
                self.providers.names().join(", ")
            );
        };
        Ok((provider, selection.model.name))
    }

    fn select_model(
        &self,
        requested: Option<&str>,
        capability: Capability,
    ) -> Result<EffectiveSelection> {
        let selection = self
            .model_selector
            .select(requested, capability)
            .map_err(anyhow::Error::msg)?;
        // An explicit request that had to be substituted is worth surfacing;
        // the implicit default is not.
        let fallback_reason = selection
            .requested
            .as_ref()
            .and(selection.fallback_reason.clone());
        Ok(EffectiveSelection {
            model: selection.model,
            fallback_reason,
        })
    }
}

fn payload_prompt_text(payload: &Value) -> String {
    payload
        .get("contents")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|content| content.get("parts").and_then(Value::as_array))
        .flatten()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect::<Vec<&str>>()
        .join("\n")
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() || parts.last().map(String::as_str) == Some(trimmed) {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

/// Event log failures never fail a generation.
fn log_event(events: &EventWriter, event_type: &str, payload: Value) {
    let _ = events.emit(event_type, map_object(payload));
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let digest = Sha256::digest(prompt.as_bytes());
    (digest[0], digest[1], digest[2])
}

fn short_id(prompt: &str) -> String {
    let digest = Sha256::digest(prompt.as_bytes());
    hex::encode(&digest[..4])
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use fridge_contracts::recipes::{Difficulty, STAPLE_SEASONINGS};
    use fridge_contracts::session::SessionView;
    use fridge_contracts::GENERATION_FAILED_MESSAGE;

    use super::*;

    type Reply = Box<dyn Fn(&str, &Value) -> Result<Value> + Send + Sync>;

    /// Provider double: counts calls, optionally sleeps per prompt, then
    /// answers through a closure.
    struct ScriptedProvider {
        name: &'static str,
        calls: Arc<AtomicUsize>,
        delays_ms: HashMap<String, u64>,
        reply: Reply,
    }

    impl ScriptedProvider {
        fn new(reply: impl Fn(&str, &Value) -> Result<Value> + Send + Sync + 'static) -> Self {
            Self {
                name: "gemini",
                calls: Arc::new(AtomicUsize::new(0)),
                delays_ms: HashMap::new(),
                reply: Box::new(reply),
            }
        }

        fn with_delay(mut self, prompt_contains: &str, millis: u64) -> Self {
            self.delays_ms.insert(prompt_contains.to_string(), millis);
            self
        }
    }

    impl ContentProvider for ScriptedProvider {
        fn name(&self) -> &str {
            self.name
        }

        fn generate_content(&self, model: &str, payload: &Value) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let prompt = payload_prompt_text(payload);
            if let Some(millis) = self
                .delays_ms
                .iter()
                .find(|(needle, _)| prompt.contains(needle.as_str()))
                .map(|(_, millis)| *millis)
            {
                thread::sleep(Duration::from_millis(millis));
            }
            (self.reply)(model, payload)
        }
    }

    fn text_response(text: &str) -> Value {
        json!({
            "candidates": [{
                "content": { "role": "model", "parts": [{ "text": text }] },
                "finishReason": "STOP",
            }]
        })
    }

    fn inline_response(data: &str) -> Value {
        json!({
            "candidates": [{
                "content": {
                    "parts": [
                        { "text": "here is your dish" },
                        { "inlineData": { "mimeType": "image/png", "data": data } },
                    ]
                }
            }]
        })
    }

    fn lunch_recipes_json() -> String {
        let row = |title: &str, prompt: &str, missing: Value| {
            json!({
                "title": title,
                "description": "간단한 점심",
                "ingredients": ["egg", "onion", "bacon"],
                "missingIngredients": missing,
                "instructions": ["Prep", "Cook", "Serve"],
                "cookingTime": "20분",
                "difficulty": "쉬움",
                "calories": "450kcal",
                "imagePrompt": prompt,
            })
        };
        json!({
            "recipes": [
                row("베이컨 에그 볶음밥", "bacon egg fried rice", json!(["rice", "salt"])),
                row("양파 베이컨 오믈렛", "onion bacon omelette", json!(["milk", "cooking oil"])),
                row("에그 베이컨 토스트", "egg bacon toast", json!(["bread", "설탕"])),
            ]
        })
        .to_string()
    }

    fn engine_with(provider: ScriptedProvider) -> Result<ChefEngine> {
        let mut providers = ProviderRegistry::new();
        providers.register(provider);
        ChefEngine::with_providers(
            &EngineConfig::default(),
            EventWriter::disabled("test"),
            providers,
        )
    }

    fn ready_session(engine: &mut ChefEngine) -> Result<RecipeSession> {
        let mut session = RecipeSession::new();
        session.set_ingredients("egg, onion, bacon");
        engine.run_generation(&mut session)?;
        Ok(session)
    }

    fn recipe_or_image(
        recipe_json: String,
    ) -> impl Fn(&str, &Value) -> Result<Value> + Send + Sync + 'static {
        move |_model: &str, payload: &Value| {
            let prompt = payload_prompt_text(payload);
            if prompt.starts_with("Professional food photography of ") {
                return Ok(inline_response(&BASE64.encode(prompt.as_bytes())));
            }
            Ok(text_response(&recipe_json))
        }
    }

    #[test]
    fn config_reads_key_fallbacks_and_clamps_timeout() {
        let vars: HashMap<&str, &str> = [
            ("API_KEY", "plain-key"),
            ("GEMINI_API_BASE", "https://proxy.test/v1beta/"),
            ("FRIDGE_TEXT_MODEL", "  "),
            ("FRIDGE_REQUEST_TIMEOUT", "900"),
        ]
        .into_iter()
        .collect();
        let config = EngineConfig::from_lookup(|key| vars.get(key).map(|value| value.to_string()));
        assert_eq!(config.api_key.as_deref(), Some("plain-key"));
        assert_eq!(config.api_base, "https://proxy.test/v1beta");
        assert_eq!(config.text_model, None);
        assert_eq!(config.request_timeout_s, 300.0);

        let defaults = EngineConfig::from_lookup(|_| None);
        assert_eq!(defaults, EngineConfig::default());
    }

    #[test]
    fn gemini_endpoint_accepts_bare_and_prefixed_models() {
        let provider = GeminiProvider::new(&EngineConfig::default());
        assert_eq!(
            provider.endpoint_for_model("gemini-3-flash-preview"),
            format!("{DEFAULT_API_BASE}/models/gemini-3-flash-preview:generateContent")
        );
        assert_eq!(
            provider.endpoint_for_model("models/gemini-2.5-flash-image"),
            format!("{DEFAULT_API_BASE}/models/gemini-2.5-flash-image:generateContent")
        );
    }

    #[test]
    fn gemini_without_key_fails_before_any_request() {
        let provider = GeminiProvider::new(&EngineConfig::default());
        let err = provider
            .generate_content("gemini-3-flash-preview", &json!({}))
            .unwrap_err();
        assert!(err.to_string().contains("GEMINI_API_KEY"));
    }

    #[test]
    fn recipe_payload_embeds_inputs_policy_and_schema() -> Result<()> {
        let query = IngredientQuery::parse("egg, onion, bacon")?;
        let payload = build_recipe_payload(MealTime::Lunch, &query);
        let prompt = payload_prompt_text(&payload);
        assert!(prompt.contains("식사 시간: 점심"));
        assert!(prompt.contains("냉장고 재료: egg, onion, bacon"));
        assert!(prompt.contains("소금, 설탕, 식용유"));
        assert!(prompt.contains("한국어로 답변하세요"));
        assert_eq!(
            payload["generationConfig"]["responseMimeType"],
            json!("application/json")
        );
        assert_eq!(
            payload["generationConfig"]["responseSchema"],
            recipe_response_schema()
        );
        Ok(())
    }

    #[test]
    fn lunch_scenario_returns_three_recipes_without_staples() -> Result<()> {
        let provider = ScriptedProvider::new(recipe_or_image(lunch_recipes_json()));
        let generator = RecipeGenerator::new(
            Arc::new(provider),
            "gemini-3-flash-preview",
            EventWriter::disabled("test"),
        );
        let query = IngredientQuery::parse("egg, onion, bacon")?;
        let recipes = generator.generate(MealTime::Lunch, &query)?;

        assert_eq!(recipes.len(), 3);
        let offered = query.items();
        for recipe in &recipes {
            assert!(recipe.ingredients.iter().all(|item| offered.contains(item)));
            assert!(recipe
                .missing_ingredients
                .iter()
                .all(|item| !STAPLE_SEASONINGS.contains(&item.to_lowercase().as_str())));
            assert!(Difficulty::LABELS.contains(&recipe.difficulty.label()));
        }
        assert_eq!(recipes.recipes()[1].missing_ingredients, vec!["milk"]);
        Ok(())
    }

    #[test]
    fn upstream_error_is_one_generation_error_without_retry() -> Result<()> {
        let provider = ScriptedProvider::new(|_: &str, _: &Value| bail!("socket closed"));
        let calls = provider.calls.clone();
        let mut engine = engine_with(provider)?;
        let mut session = RecipeSession::new();
        session.set_ingredients("egg, onion, bacon");

        let err = engine.run_generation(&mut session).unwrap_err();
        assert!(matches!(err, ChefError::Generation { ref reason } if reason.contains("socket closed")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(session.recipes().is_none());
        assert_eq!(
            session.view(),
            SessionView::Error {
                message: GENERATION_FAILED_MESSAGE
            }
        );
        Ok(())
    }

    #[test]
    fn malformed_or_blocked_responses_are_generation_errors() -> Result<()> {
        let query = IngredientQuery::parse("egg")?;
        for reply in [
            text_response("{\"recipes\": [1, 2"),
            text_response("{\"recipes\": []}"),
            json!({ "promptFeedback": { "blockReason": "SAFETY" } }),
            json!({ "candidates": [{ "content": { "parts": [] }, "finishReason": "MAX_TOKENS" }] }),
        ] {
            let provider = ScriptedProvider::new(move |_: &str, _: &Value| Ok(reply.clone()));
            let generator = RecipeGenerator::new(
                Arc::new(provider),
                "gemini-3-flash-preview",
                EventWriter::disabled("test"),
            );
            let err = generator.generate(MealTime::Dinner, &query).unwrap_err();
            assert!(matches!(err, ChefError::Generation { .. }));
        }
        Ok(())
    }

    #[test]
    fn empty_input_never_reaches_the_provider() -> Result<()> {
        let provider = ScriptedProvider::new(recipe_or_image(lunch_recipes_json()));
        let calls = provider.calls.clone();
        let mut engine = engine_with(provider)?;
        let mut session = RecipeSession::new();
        session.set_ingredients(" \t ");

        assert_eq!(engine.run_generation(&mut session), Err(ChefError::EmptyInput));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn image_payload_wraps_prompt_and_requests_square() {
        let payload = build_image_payload("kimchi stew");
        assert_eq!(
            payload_prompt_text(&payload),
            "Professional food photography of kimchi stew, appetizing, high resolution, 4k, soft natural lighting, top-down view."
        );
        assert_eq!(
            payload["generationConfig"]["imageConfig"]["aspectRatio"],
            json!("1:1")
        );
    }

    #[test]
    fn inline_image_becomes_data_uri() {
        let provider = ScriptedProvider::new(|_: &str, _: &Value| Ok(inline_response("aGVsbG8=")));
        let generator = ImageGenerator::new(
            Arc::new(provider),
            "gemini-2.5-flash-image",
            EventWriter::disabled("test"),
        );
        let image = generator.generate_image("kimchi stew", "김치찌개");
        assert_eq!(image.to_uri(), "data:image/png;base64,aGVsbG8=");
    }

    #[test]
    fn missing_image_part_or_error_falls_back_to_seeded_placeholder() {
        let no_image = ScriptedProvider::new(|_: &str, _: &Value| Ok(text_response("sorry")));
        let failing = ScriptedProvider::new(|_: &str, _: &Value| bail!("quota exceeded"));
        let undecodable = ScriptedProvider::new(|_: &str, _: &Value| Ok(inline_response("%%%")));

        let expected = "https://picsum.photos/seed/%EA%B9%80%EC%B9%98%EC%B0%8C%EA%B0%9C/400/400";
        for provider in [no_image, failing, undecodable] {
            let generator = ImageGenerator::new(
                Arc::new(provider),
                "gemini-2.5-flash-image",
                EventWriter::disabled("test"),
            );
            let first = generator.generate_image("kimchi stew", "김치찌개");
            let second = generator.generate_image("kimchi stew", "김치찌개");
            assert_eq!(first.to_uri(), expected);
            assert_eq!(first, second);
        }
    }

    #[test]
    fn placeholder_escapes_seed_and_degrades_to_generic() {
        assert_eq!(
            placeholder_image("Egg / Bacon Toast").to_uri(),
            "https://picsum.photos/seed/Egg%20%2F%20Bacon%20Toast/400/400"
        );
        assert_eq!(placeholder_image("   ").to_uri(), GENERIC_PLACEHOLDER_URL);
    }

    #[test]
    fn images_attach_to_their_own_recipe_when_resolved_out_of_order() -> Result<()> {
        let provider = ScriptedProvider::new(recipe_or_image(lunch_recipes_json()))
            .with_delay("bacon egg fried rice", 150)
            .with_delay("onion bacon omelette", 75);
        let mut engine = engine_with(provider)?;
        let mut session = ready_session(&mut engine)?;

        assert_eq!(engine.fill_images(&mut session), 3);
        assert_eq!(session.pending_images(), 0);
        for index in 0..3 {
            let recipe = session
                .recipe_with_image(index)
                .expect("recipe exists at index");
            let expected = format!(
                "data:image/png;base64,{}",
                BASE64.encode(build_image_prompt(&recipe.image_prompt).as_bytes())
            );
            assert_eq!(recipe.image_url.as_deref(), Some(expected.as_str()));
        }
        Ok(())
    }

    #[test]
    fn late_images_from_a_superseded_generation_are_discarded() -> Result<()> {
        let provider = ScriptedProvider::new(recipe_or_image(lunch_recipes_json()))
            .with_delay("Professional food photography", 50);
        let mut engine = engine_with(provider)?;
        let mut session = ready_session(&mut engine)?;
        let stale_ticket = session.ticket().expect("ticket after generation");
        let stale_recipes = session.recipes().cloned().expect("results");

        let (tx, rx) = mpsc::channel();
        let handles = engine.spawn_image_jobs(stale_ticket, &stale_recipes, tx);
        let fresh_ticket = engine.run_generation(&mut session)?;
        assert_ne!(stale_ticket, fresh_ticket);

        let mut attached = 0;
        for delivery in rx {
            if engine.apply_delivery(&mut session, delivery) {
                attached += 1;
            }
        }
        for handle in handles {
            handle.join().expect("image worker panicked");
        }
        assert_eq!(attached, 0);
        assert_eq!(session.pending_images(), 3);
        Ok(())
    }

    #[test]
    fn dryrun_models_produce_recipes_and_decodable_images() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let config = EngineConfig {
            text_model: Some("dryrun-text-1".to_string()),
            image_model: Some("dryrun-image-1".to_string()),
            ..EngineConfig::default()
        };
        let mut engine = ChefEngine::new(&config, Some(events_path.clone()))?;
        let mut session = RecipeSession::new();
        session.set_meal_time(MealTime::Breakfast);
        session.set_ingredients("두부, 김치");
        engine.run_generation(&mut session)?;
        assert_eq!(engine.fill_images(&mut session), 3);
        engine.finish()?;

        let recipes = session.recipes().expect("results");
        assert_eq!(recipes.titles(), vec!["두부 볶음", "김치 수프", "두부 그라탕"]);
        for index in 0..3 {
            let recipe = session.recipe_with_image(index).expect("recipe");
            let uri = recipe.image_url.unwrap_or_default();
            let data = uri
                .strip_prefix("data:image/png;base64,")
                .expect("inline png");
            let decoded = image::load_from_memory(&BASE64.decode(data)?)?;
            assert_eq!(decoded.width(), 64);
        }

        let raw = fs::read_to_string(events_path)?;
        let types: Vec<String> = raw
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .collect();
        let started = types.iter().position(|value| value == "generation_started");
        let ready = types.iter().position(|value| value == "recipes_ready");
        assert!(started.is_some() && started < ready);
        assert_eq!(types.iter().filter(|value| *value == "image_ready").count(), 3);
        assert_eq!(types.last().map(String::as_str), Some("session_finished"));
        Ok(())
    }

    #[test]
    fn text_model_substitution_note_survives_image_fetch() -> Result<()> {
        let provider = ScriptedProvider::new(recipe_or_image(lunch_recipes_json()));
        let mut engine = engine_with(provider)?;
        engine.set_text_model(Some("no-such-model".to_string()));
        let mut session = ready_session(&mut engine)?;
        assert_eq!(engine.fill_images(&mut session), 3);

        let text_note = engine.fallback_reason(Capability::Text).unwrap_or_default();
        assert!(text_note.contains("no-such-model"));
        assert_eq!(engine.fallback_reason(Capability::Image), None);
        assert_eq!(engine.fallback_reasons(), vec![text_note]);

        engine.set_image_model(Some("dryrun-text-1".to_string()));
        engine.fill_images(&mut session);
        assert_eq!(engine.fallback_reasons().len(), 2);

        engine.set_text_model(None);
        engine.recipe_generator()?;
        assert_eq!(engine.fallback_reason(Capability::Text), None);
        Ok(())
    }

    #[test]
    fn failed_or_empty_image_calls_are_not_retried() {
        for provider in [
            ScriptedProvider::new(|_: &str, _: &Value| bail!("quota exceeded")),
            ScriptedProvider::new(|_: &str, _: &Value| Ok(text_response("no picture today"))),
        ] {
            let calls = provider.calls.clone();
            let generator = ImageGenerator::new(
                Arc::new(provider),
                "gemini-2.5-flash-image",
                EventWriter::disabled("test"),
            );
            assert!(generator.generate_image("kimchi stew", "김치찌개").is_placeholder());
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn panicking_image_worker_is_logged_and_not_counted() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let recipes = recipe_or_image(lunch_recipes_json());
        let provider = ScriptedProvider::new(move |model: &str, payload: &Value| {
            if payload_prompt_text(payload).contains("onion bacon omelette") {
                panic!("image backend crashed");
            }
            recipes(model, payload)
        });
        let mut providers = ProviderRegistry::new();
        providers.register(provider);
        let mut engine = ChefEngine::with_providers(
            &EngineConfig::default(),
            EventWriter::new(&events_path, "test"),
            providers,
        )?;
        let mut session = ready_session(&mut engine)?;

        assert_eq!(engine.fill_images(&mut session), 2);
        assert_eq!(session.pending_images(), 1);

        let raw = fs::read_to_string(events_path)?;
        let crashed: Vec<Value> = raw
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter(|row| row["reason"] == json!("image worker panicked"))
            .collect();
        assert_eq!(crashed.len(), 1);
        assert_eq!(crashed[0]["type"], json!("image_discarded"));
        assert_eq!(crashed[0]["index"], json!(1));
        Ok(())
    }

    #[test]
    fn gemini_timeout_is_clamped_for_hand_built_configs() {
        for (seconds, expected) in [(f64::NAN, 90.0), (-3.0, 5.0), (1e9, 300.0), (42.0, 42.0)] {
            let config = EngineConfig {
                request_timeout_s: seconds,
                ..EngineConfig::default()
            };
            let provider = GeminiProvider::new(&config);
            assert_eq!(provider.timeout, Duration::from_secs_f64(expected));
        }
    }

    #[test]
    fn unregistered_provider_degrades_images_but_fails_recipes() -> Result<()> {
        let mut engine = ChefEngine::with_providers(
            &EngineConfig::default(),
            EventWriter::disabled("test"),
            ProviderRegistry::new(),
        )?;
        let image = engine.generate_image("kimchi stew", "김치찌개");
        assert!(image.is_placeholder());

        let query = IngredientQuery::parse("김치")?;
        let err = engine.generate_recipes(MealTime::Dinner, &query).unwrap_err();
        assert!(matches!(err, ChefError::Generation { .. }));
        Ok(())
    }

    #[test]
    fn error_chain_text_preserves_nested_contexts() {
        let err = anyhow::anyhow!("socket closed")
            .context("Gemini request failed (https://example.test)")
            .context("recipe request failed");
        let rendered = error_chain_text(&err, 400);
        assert!(rendered.contains("recipe request failed"));
        assert!(rendered.contains("Gemini request failed"));
        assert!(rendered.contains("socket closed"));
    }

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn generators_are_shareable_across_threads() {
        assert_send_sync::<RecipeGenerator>();
        assert_send_sync::<ImageGenerator>();
    }
}
