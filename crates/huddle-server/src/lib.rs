//! Huddle signaling relay
//!
//! Tracks room membership and routes offer/answer/candidate messages
//! between call participants; media never passes through it.

pub mod api;
pub mod error;
pub mod rooms;
pub mod state;
pub mod ws;

/// Create and configure the relay application
pub fn create_app(config: state::Config) -> axum::Router {
    let app_state = state::AppState::new(config);
    api::create_router(app_state)
}
