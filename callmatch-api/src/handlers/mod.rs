mod app;
mod events;
mod matching;

pub use app::{add_routes, ApiState};
