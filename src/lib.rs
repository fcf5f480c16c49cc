//! # Defense KB
//!
//! A locally hosted retrieval service for an AI-defense knowledge base. It
//! keeps a searchable index in sync with the upstream framework repository
//! and answers similarity queries while syncs run in the background.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌─────────┐   ┌──────────┐
//! │ Fetcher  │──▶│ Extractor │──▶│ Builder │──▶│ Staging  │
//! │ (GitHub) │   │ (JS/JSON) │   │ (embed) │   │   gen    │
//! └──────────┘   └───────────┘   └─────────┘   └────┬─────┘
//!                                                  │ swap
//!                     ┌──────────┐            ┌────▼─────┐
//!                     │ CLI/HTTP │◀───reads───│  Active  │
//!                     │  (dkb)   │            │   gen    │
//!                     └──────────┘            └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! dkb sync                          # fetch, extract, embed, swap
//! dkb search "prompt injection"     # query the active generation
//! dkb serve                         # HTTP API + periodic sync loop
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`fetch`] | Upstream version resolution and file download |
//! | [`extract`] | Source parsing into documents |
//! | [`embedding`] | Embedding backends |
//! | [`builder`] | Staging generation build |
//! | [`generation`] | Generation storage |
//! | [`slots`] | Active / retired / staging layout on disk |
//! | [`swap`] | Cut-over under the writer lock |
//! | [`engine`] | Reader/writer-gated query engine |
//! | [`sync`] | Sync pipeline and loop |
//! | [`server`] | HTTP read API |
//! | [`middleware`] | Rate limits, audit events, security headers |

pub mod builder;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod generation;
pub mod lock;
pub mod logging;
pub mod middleware;
pub mod security;
pub mod server;
pub mod service;
pub mod slots;
pub mod status;
pub mod swap;
pub mod sync;
pub mod version;
