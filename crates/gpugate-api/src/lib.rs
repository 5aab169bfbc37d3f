//! gpugate-api: OpenAI-compatible HTTP surface for gpugate
//!
//! This crate provides the inbound side of the gateway:
//! - Chat, embeddings and rerank proxying
//! - Bearer token authentication
//! - Request routing across model variants
//! - Model listing and system status

pub mod auth;
pub mod estimate;
pub mod rest;
pub mod routing;

pub use auth::{ApiKeys, Caller};
pub use estimate::TokenEstimator;
pub use rest::{create_router, ApiError, AppState};
pub use routing::{RequestRouter, RouteKind};
