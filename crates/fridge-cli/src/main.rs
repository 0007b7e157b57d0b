use std::io::{self, ErrorKind, Write};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fridge_contracts::chat::{parse_intent, CHAT_HELP_COMMANDS};
use fridge_contracts::recipes::{ImageRef, MealTime, Recipe, RecipeSet};
use fridge_contracts::session::{ImageSlot, RecipeSession, SessionView};
use fridge_contracts::{ChefError, EMPTY_INPUT_MESSAGE, GENERATION_FAILED_MESSAGE};
use fridge_engine::{ChefEngine, EngineConfig, ImageDelivery};
use serde_json::Value;

#[derive(Debug, Parser)]
#[command(
    name = "fridge-chef",
    version,
    about = "Three recipe ideas from whatever is left in your fridge"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Suggest(SuggestArgs),
    Chat(ChatArgs),
}

#[derive(Debug, Parser)]
struct SuggestArgs {
    /// 아침/점심/저녁 or breakfast/lunch/dinner.
    #[arg(long, default_value = "lunch")]
    meal: String,
    #[arg(long)]
    ingredients: String,
    #[arg(long)]
    text_model: Option<String>,
    #[arg(long)]
    image_model: Option<String>,
    #[arg(long)]
    no_images: bool,
    #[arg(long)]
    json: bool,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[arg(long, default_value = "lunch")]
    meal: String,
    #[arg(long)]
    text_model: Option<String>,
    #[arg(long)]
    image_model: Option<String>,
    #[arg(long)]
    events: Option<PathBuf>,
}

const EXIT_GENERATION_FAILED: i32 = 1;
const EXIT_BAD_INPUT: i32 = 2;
const CARD_MISSING_PREVIEW: usize = 2;

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("fridge-chef error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Suggest(args) => run_suggest(args),
        Command::Chat(args) => {
            run_chat(args)?;
            Ok(0)
        }
    }
}

fn engine_config(text_model: Option<String>, image_model: Option<String>) -> EngineConfig {
    let mut config = EngineConfig::from_env();
    if let Some(model) = non_empty(text_model) {
        config.text_model = Some(model);
    }
    if let Some(model) = non_empty(image_model) {
        config.image_model = Some(model);
    }
    config
}

fn run_suggest(args: SuggestArgs) -> Result<i32> {
    let meal_time = match args.meal.parse::<MealTime>() {
        Ok(meal_time) => meal_time,
        Err(err) => {
            eprintln!("{}", err.user_message());
            return Ok(EXIT_BAD_INPUT);
        }
    };

    let config = engine_config(args.text_model.clone(), args.image_model.clone());
    let mut engine = ChefEngine::new(&config, args.events.clone())?;
    let mut session = RecipeSession::new();
    session.set_meal_time(meal_time);
    session.set_ingredients(args.ingredients.as_str());

    let code = match engine.run_generation(&mut session) {
        Ok(_) => {
            if !args.no_images {
                engine.fill_images(&mut session);
            }
            for reason in engine.fallback_reasons() {
                eprintln!("note: {reason}");
            }
            if args.json {
                let recipes: Vec<Recipe> = (0..session.recipes().map_or(0, RecipeSet::len))
                    .filter_map(|index| session.recipe_with_image(index))
                    .collect();
                println!(
                    "{}",
                    serde_json::to_string_pretty(&recipes).context("recipe JSON encode failed")?
                );
            } else {
                println!("{}", render_view(session.view()));
            }
            0
        }
        Err(err @ ChefError::EmptyInput) => {
            eprintln!("{}", err.user_message());
            EXIT_BAD_INPUT
        }
        Err(err) => {
            eprintln!("{}", err.user_message());
            eprintln!("  ({err})");
            EXIT_GENERATION_FAILED
        }
    };
    engine.finish()?;
    Ok(code)
}

fn run_chat(args: ChatArgs) -> Result<()> {
    let meal_time = args
        .meal
        .parse::<MealTime>()
        .map_err(|err| anyhow::anyhow!(err.user_message()))?;
    let config = engine_config(args.text_model.clone(), args.image_model.clone());
    let mut engine = ChefEngine::new(&config, args.events.clone())?;
    let mut session = RecipeSession::new();
    session.set_meal_time(meal_time);
    let (tx, rx) = mpsc::channel::<ImageDelivery>();

    let stdin = io::stdin();
    let mut line = String::new();

    println!(
        "Fridge Chef started ({}). Type your ingredients, or /help for commands.",
        session.meal_time()
    );

    loop {
        drain_deliveries(&engine, &mut session, &rx);
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let input = line.trim_end_matches(['\n', '\r']);
        let intent = parse_intent(input);
        match intent.action.as_str() {
            "noop" => continue,
            "help" => {
                println!("Commands: {}", CHAT_HELP_COMMANDS.join(" "));
                println!("Anything else is read as your ingredient list.");
            }
            "set_meal_time" => {
                match value_as_non_empty_string(intent.command_args.get("meal_time")) {
                    Some(raw) => match raw.parse::<MealTime>() {
                        Ok(meal_time) => {
                            session.set_meal_time(meal_time);
                            println!("Meal time set to {meal_time}");
                        }
                        Err(err) => println!("{}", err.user_message()),
                    },
                    None => println!("Meal time is {}", session.meal_time()),
                }
            }
            "set_text_model" => {
                let current = engine.text_model().unwrap_or_default().to_string();
                let model = value_as_non_empty_string(intent.command_args.get("model"))
                    .unwrap_or(current);
                engine.set_text_model(non_empty(Some(model.clone())));
                println!("Text model set to {}", display_model(&model));
            }
            "set_image_model" => {
                let current = engine.image_model().unwrap_or_default().to_string();
                let model = value_as_non_empty_string(intent.command_args.get("model"))
                    .unwrap_or(current);
                engine.set_image_model(non_empty(Some(model.clone())));
                println!("Image model set to {}", display_model(&model));
            }
            "generate" => {
                let Some(prompt) = intent.prompt.as_deref() else {
                    continue;
                };
                session.set_ingredients(prompt);
                generate_in_chat(&mut engine, &mut session, &tx);
            }
            "retry" => generate_in_chat(&mut engine, &mut session, &tx),
            "list" => println!("{}", render_view(session.view())),
            "open_detail" => {
                let index = intent
                    .command_args
                    .get("index")
                    .and_then(Value::as_u64)
                    .and_then(|value| usize::try_from(value).ok());
                match index {
                    Some(index) if session.open_detail(index) => {
                        if let Some(recipe) = session.recipe_with_image(index) {
                            println!("{}", render_detail(index, &recipe));
                        }
                    }
                    _ => println!("/show needs a recipe number from the current list"),
                }
            }
            "close_detail" => {
                if session.detail().is_some() {
                    session.close_detail();
                    println!("{}", render_view(session.view()));
                }
            }
            "quit" => break,
            "unknown" => {
                let command = value_as_non_empty_string(intent.command_args.get("command"))
                    .unwrap_or_default();
                println!("Unknown command /{command}. Type /help for commands.");
            }
            _ => {}
        }
    }

    engine.finish()?;
    Ok(())
}

fn generate_in_chat(engine: &mut ChefEngine, session: &mut RecipeSession, tx: &Sender<ImageDelivery>) {
    println!("{}", render_view(SessionView::Empty { generating: true }));
    match engine.run_generation(session) {
        Ok(ticket) => {
            if let Some(recipes) = session.recipes().cloned() {
                // Workers detach; their deliveries are checked against the ticket on arrival.
                engine.spawn_image_jobs(ticket, &recipes, tx.clone());
            }
            for reason in engine.fallback_reasons() {
                println!("note: {reason}");
            }
            println!("{}", render_view(session.view()));
        }
        Err(err @ ChefError::EmptyInput) => println!("{}", err.user_message()),
        Err(_) => println!(
            "{}",
            session.error_message().unwrap_or(GENERATION_FAILED_MESSAGE)
        ),
    }
}

fn drain_deliveries(engine: &ChefEngine, session: &mut RecipeSession, rx: &Receiver<ImageDelivery>) {
    while let Ok(delivery) = rx.try_recv() {
        let position = delivery.index + 1;
        let title = delivery.title.clone();
        let status = image_status(&ImageSlot::Ready(delivery.image.clone()));
        if engine.apply_delivery(session, delivery) {
            println!("[추천 {position}] {title}: {status}");
        }
    }
}

fn render_view(view: SessionView<'_>) -> String {
    match view {
        SessionView::Empty { generating: false } => {
            format!("{EMPTY_INPUT_MESSAGE} 세 가지 레시피를 추천해드려요.")
        }
        SessionView::Empty { generating: true } => "레시피를 생성하는 중...".to_string(),
        SessionView::Error { message } => message.to_string(),
        SessionView::Results { recipes, images } => recipes
            .iter()
            .enumerate()
            .map(|(index, recipe)| {
                let slot = images.get(index).unwrap_or(&ImageSlot::Loading);
                render_card(index, recipe, slot)
            })
            .collect::<Vec<String>>()
            .join("\n\n"),
    }
}

fn render_card(index: usize, recipe: &Recipe, slot: &ImageSlot) -> String {
    let mut lines = vec![
        format!("[추천 {}] {}", index + 1, recipe.title),
        format!("  {}", recipe.description),
        format!(
            "  {} · ⏱️ {} · 🔥 {}",
            recipe.difficulty, recipe.cooking_time, recipe.calories
        ),
    ];
    if !recipe.missing_ingredients.is_empty() {
        let mut preview = recipe
            .missing_ingredients
            .iter()
            .take(CARD_MISSING_PREVIEW)
            .map(|item| format!("+{item}"))
            .collect::<Vec<String>>()
            .join(" ");
        let hidden = recipe
            .missing_ingredients
            .len()
            .saturating_sub(CARD_MISSING_PREVIEW);
        if hidden > 0 {
            preview.push_str(&format!(" 외 {hidden}개"));
        }
        lines.push(format!("  추가 재료: {preview}"));
    }
    lines.push(format!("  {}", image_status(slot)));
    lines.join("\n")
}

fn render_detail(index: usize, recipe: &Recipe) -> String {
    let mut lines = vec![
        format!("[추천 {}] {}", index + 1, recipe.title),
        recipe.description.clone(),
        format!(
            "난이도 {} · ⏱️ {} · 🔥 {}",
            recipe.difficulty, recipe.cooking_time, recipe.calories
        ),
    ];
    if let Some(url) = recipe.image_url.as_deref() {
        lines.push(format!("이미지: {}", shorten_uri(url)));
    }

    lines.push(String::new());
    lines.push("보유 재료".to_string());
    lines.extend(recipe.ingredients.iter().map(|item| format!("  - {item}")));

    lines.push(String::new());
    lines.push("추가로 필요한 재료".to_string());
    if recipe.missing_ingredients.is_empty() {
        lines.push("  없음".to_string());
    } else {
        lines.extend(
            recipe
                .missing_ingredients
                .iter()
                .map(|item| format!("  - {item}")),
        );
    }

    lines.push(String::new());
    lines.push("조리 순서".to_string());
    lines.extend(
        recipe
            .instructions
            .iter()
            .enumerate()
            .map(|(step, text)| format!("  {}. {text}", step + 1)),
    );
    lines.push(String::new());
    lines.push("/close 로 목록으로 돌아갑니다.".to_string());
    lines.join("\n")
}

fn image_status(slot: &ImageSlot) -> String {
    match slot.image() {
        None => "이미지 생성 중...".to_string(),
        Some(image @ ImageRef::Inline { mime_type, .. }) => {
            format!("이미지 준비됨 ({mime_type}, {})", shorten_uri(&image.to_uri()))
        }
        Some(ImageRef::Placeholder { url }) => format!("대체 이미지 {url}"),
    }
}

/// Data URIs are far too long for a terminal line.
fn shorten_uri(uri: &str) -> String {
    const KEEP: usize = 48;
    if uri.chars().count() <= KEEP {
        return uri.to_string();
    }
    uri.chars().take(KEEP).collect::<String>() + "…"
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

fn display_model(model: &str) -> &str {
    if model.trim().is_empty() {
        "default"
    } else {
        model
    }
}

fn value_as_non_empty_string(value: Option<&Value>) -> Option<String> {
    let raw = value
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    if raw.is_empty() {
        None
    } else {
        Some(raw.to_string())
    }
}
