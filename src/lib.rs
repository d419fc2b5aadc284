pub mod appresult;
pub mod config;
pub mod db;
pub mod error;
pub mod relay;
pub mod store;

use std::sync::Arc;

use axum::{Router, debug_handler, extract::{FromRef, State}, http::{HeaderValue, Method}, routing::get};
use serde_json::Value;
use tower_http::cors::CorsLayer;

pub use appresult::{AppError, AppResult};
pub use config::Config;
pub use error::{RelayError, RelayResult, StoreError};
pub use relay::Relay;

use crate::{relay::parse_id, store::MessageStore};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub relay: Arc<Relay>,
}

pub fn router(app_state: AppState, cors_origin: &str) -> anyhow::Result<Router> {
    let cors = CorsLayer::new()
        .allow_origin(cors_origin.parse::<HeaderValue>()?)
        .allow_methods([Method::GET, Method::POST]);

    Ok(Router::new()
        .route("/health", get(health))
        .route("/ws", get(relay::relay_ws))
        .with_state(app_state)
        .layer(cors))
}

#[debug_handler(state = AppState)]
async fn health(State(relay): State<Arc<Relay>>) -> AppResult<&'static str> {
    relay.store().ping().await?;
    Ok("ok")
}

/// Typed field access on loosely shaped event payloads.
pub trait GetField {
    fn get_id_field(&self, event: &'static str, field: &'static str) -> RelayResult<i64>;
    fn get_opt_id_field(&self, field: &'static str) -> RelayResult<Option<i64>>;
    fn get_str_field(&self, event: &'static str, field: &'static str) -> RelayResult<String>;
}

impl GetField for Value {
    fn get_id_field(&self, event: &'static str, field: &'static str) -> RelayResult<i64> {
        parse_id(event, field, self.get(field).unwrap_or(&Value::Null), true)
    }

    fn get_opt_id_field(&self, field: &'static str) -> RelayResult<Option<i64>> {
        match self.get(field) {
            None | Some(Value::Null) | Some(Value::Bool(false)) => Ok(None),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(value) => match parse_id("", field, value, true) {
                Ok(id) => Ok(Some(id)),
                Err(RelayError::Validation { .. }) => Ok(None),
                Err(err) => Err(err),
            },
        }
    }

    fn get_str_field(&self, event: &'static str, field: &'static str) -> RelayResult<String> {
        Ok(
            self.get(field)
            .ok_or_else(|| RelayError::validation(event, format!("expected {field} in {self}")))?
            .as_str()
            .ok_or_else(|| RelayError::validation(event, format!("expected {field} in {self} to be string")))?
            .to_owned()
        )
    }
}
