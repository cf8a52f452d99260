//! jailwarden - jail state reconciliation and control engine.
//!
//! Reconciles three inconsistent views of a fail2ban host (static jail
//! configuration, the daemon's live state, and the ban ledger) into one
//! cache-friendly view, and forwards idempotent control commands to the
//! daemon with post-condition verification.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            Engine                                │
//! ├────────────┬────────────┬───────────────┬───────────┬────────────┤
//! │ Discovery  │   Probe    │ ActionExecutor│ Assembler │  TtlCache  │
//! │ jail.conf  │ jail status│ start/stop    │ merge +   │ fresh +    │
//! │ jail.d     │ NOK→off    │ settle+verify │ status    │ stale copy │
//! └─────┬──────┴─────┬──────┴───────┬───────┴───────────┴────────────┘
//!       │            │              │
//!       ▼            ▼              ▼
//!  ┌──────────────────────────────────────┐   ┌──────────────────────┐
//!  │ EnforcementDaemon (trait)            │   │ AgentRegistry (sqlx) │
//!  │  Fail2banClient ─► CommandRunner     │   │ AuditLog (jsonl)     │
//!  │  MemoryDaemon                        │   └──────────────────────┘
//!  └──────────────────────────────────────┘
//! ```

pub mod agents;
pub mod audit;
pub mod bans;
pub mod cache;
pub mod config;
pub mod daemon;
pub mod db;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod executor;
pub mod host;
pub mod http;
pub mod metrics;
pub mod names;
pub mod parser;
pub mod probe;
pub mod push;
pub mod reconcile;
pub mod telemetry;

pub use engine::{Engine, EngineParams};
pub use error::{EngineError, EngineResult};
pub use names::JailName;
