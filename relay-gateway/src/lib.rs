//! # Relay Gateway
//!
//! The HTTP surface over the [`relay_dispatch`] core: an OpenAI-compatible
//! API that resolves logical model names to upstream endpoints, spreads
//! load across them, and masks upstream failures through transparent
//! retry and fallback.
//!
//! Endpoints:
//!
//! - `POST /v1/chat/completions` — JSON and SSE streaming
//! - `POST /v1/completions` — legacy text completions
//! - `POST /v1/embeddings`
//! - `GET /v1/models` — registered models plus route slugs
//! - `GET /health`, `GET /ready`

pub mod config;
pub mod gateway_error;
pub mod handlers;
pub mod server;
