pub mod api;
pub mod app_state;
pub mod config;
pub mod error;
pub mod hub;
pub mod inference;
pub mod layers;
pub mod llm;

pub use app_state::AppState;
pub use config::Config;
