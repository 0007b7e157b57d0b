pub mod chat;
pub mod error;
pub mod events;
pub mod models;
pub mod recipes;
pub mod session;

pub use error::{ChefError, EMPTY_INPUT_MESSAGE, GENERATION_FAILED_MESSAGE};
