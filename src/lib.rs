//! # Triage Plane
//!
//! Client-side control plane for AI-assisted Kubernetes troubleshooting.
//!
//! ## Features
//!
//! - **Resilient push connection**: one long-lived stream to the remote agent
//!   with exponential backoff, staleness detection and a health probe that
//!   resurrects a dead connection
//! - **Event dispatch**: alerts become notifications with an "Investigate"
//!   action; knowledge-base progress is throttled for display
//! - **Investigation loop**: intent classification, tool-call extraction from
//!   free-form model output, deduplication, per-tool circuit breakers,
//!   hypothesis tracking, confidence assessment and history compression
//! - **Report storage**: concluded investigations persisted in SQLite
//!
//! ## Architecture
//!
//! ```text
//! Remote agent ──(GET /events)──> ConnectionService ──> EventDispatcher ──> NotificationSink
//!                                                                   └──> ProgressThrottle
//!
//! User query ──> Investigator ──> LlmOracle (HTTP pipe)
//!                     │      └──> ToolRunner
//!                     └──> ReportStore (SQLite)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use triage_plane::{Config, Investigator};
//! use triage_plane::llm::PipeClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let oracle = Arc::new(PipeClient::new(&config.llm, config.request.clone())?);
//!     let investigator = Investigator::from_config(&config, oracle, Arc::new(MyKubectl))?;
//!     let report = investigator.investigate("Why is my pod crashing?").await;
//!     println!("{}", report.answer);
//!     Ok(())
//! }
//! ```

/// Configuration loaded from the environment.
pub mod config;
/// Resilient push connection to the remote agent.
pub mod connection;
/// Error types and result aliases for the application.
pub mod error;
/// Push event dispatch, investigation handlers and progress throttling.
pub mod events;
/// Investigation control plane.
pub mod investigation;
/// LLM oracle trait and HTTP pipe client.
pub mod llm;
/// SQLite storage for investigation reports.
pub mod storage;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use investigation::{Investigator, ToolRunner};
