//! Decision pipeline for proposed marketing actions.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │   Proposed   │────►│  Guardrails  │────►│  Allocator   │
//! │   actions    │     │ (fail closed)│     │ (sticky A/B) │
//! └──────────────┘     └──────────────┘     └──────────────┘
//!                                                  │
//!                                                  ▼
//!                      ┌──────────────┐     ┌──────────────┐
//!                      │   Outcome    │◄────│ Audit ledger │
//!                      │ (verdict+seq)│     │ (append-only)│
//!                      └──────────────┘     └──────────────┘
//! ```
//!
//! Data flows one way: an action passes every guardrail check, picks up a
//! variant assignment if it declares an experiment, and lands as exactly
//! one durable audit record before the caller sees a verdict. Rejections
//! and escalations are data, not errors; overrides are correction records,
//! never edits.

pub mod action;
pub mod config;
pub mod error;
pub mod experiment;
pub mod guardrail;
pub mod ledger;
pub mod logging;
pub mod pipeline;
