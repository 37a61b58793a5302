//! # Knowledge Sync
//!
//! Ingests engineering activity from GitHub, Slack, and Discord into a
//! project-scoped knowledge graph of features, files, decisions,
//! discussions, and contributors.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌─────────────┐   ┌──────────┐
//! │  Connectors  │──▶│  Normalizer  │──▶│   Context   │──▶│  Graph   │
//! │ GH/Slack/Dsc │   │              │   │  processor  │   │  store   │
//! └──────┬───────┘   └──────────────┘   └─────────────┘   └────┬─────┘
//!        │ rate limiter (one per platform)                      │
//!        ▼                                                      ▼
//!  ┌──────────────────────────┐                    ┌──────────────────┐
//!  │ IngestionOrchestrator    │                    │ CLI / HTTP read  │
//!  │ worker per tenant×source │                    │ (ksync, axum)    │
//!  └──────────────────────────┘                    └──────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! export GITHUB_TOKEN=ghp_... GITHUB_REPOSITORIES=acme/web
//! ksync init
//! ksync sync all
//! ksync file src/auth/session.rs
//! ksync run --serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML and environment configuration |
//! | [`models`] | Platform and normalized events, auth results, platform info |
//! | [`error`] | Connector error taxonomy and table-driven classification |
//! | [`rate_limit`] | Token bucket with exponential backoff |
//! | [`http`] | Shared rate-limited JSON client |
//! | [`traits`] | The `PlatformConnector` contract |
//! | [`normalize`] | Canonical event mapping and reference extraction |
//! | [`window`] | Oldest-first fetch windows shared by the connectors |
//! | [`connector_github`], [`connector_slack`], [`connector_discord`] | Platform connectors |
//! | [`registry`] | Connector registry and manager |
//! | [`context`] | Entity and relationship extraction |
//! | [`orchestrator`] | Sync workers, checkpoints, retry |
//! | [`store`] | Knowledge graph stores (SQLite and in-memory) |
//! | [`search`] | Similarity ranking |
//! | [`server`] | HTTP read API |
//! | [`ingest`], [`query`], [`sources`] | CLI command implementations |
//! | [`db`], [`migrate`] | Database connection and schema |

pub mod config;
pub mod connector_discord;
pub mod connector_github;
pub mod connector_slack;
pub mod context;
pub mod db;
pub mod error;
pub mod http;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod orchestrator;
pub mod query;
pub mod rate_limit;
pub mod registry;
pub mod search;
pub mod server;
pub mod sources;
pub mod store;
pub mod traits;
pub mod window;
