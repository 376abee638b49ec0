mod app;
pub mod probe;

pub use app::{app, AppState};
