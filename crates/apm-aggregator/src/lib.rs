// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # APM Aggregator
//!
//! In-process telemetry aggregation engine for an application-performance-monitoring agent.
//!
//! ## Overview
//!
//! Instrumentation adapters hand finished events to a cloneable [`coordinator::CoordinatorHandle`].
//! A single [`coordinator::EventCoordinator`] task owns the current [`aggregator::batch::WindowBatch`]
//! and is the only code that ever mutates it. On every flush tick the batch is swapped for an empty
//! one and the closed batch is handed to a detached [`flusher::Flusher`] task, which serializes it
//! into the collector payloads and delivers them through a [`transport::Transport`].
//!
//! ```text
//!  adapters ──┬─ transactions ─┐
//!             ├─ spans ────────┤        ┌──────────────┐   tick   ┌─────────┐     ┌───────────┐
//!             ├─ errors ───────┼──────> │ Coordinator  │ ───────> │ Flusher │ ──> │ Transport │
//!             └─ metrics ──────┘        │ (WindowBatch)│ <─────── │ (spawn) │     └───────────┘
//!                                       └──────────────┘ features └─────────┘
//! ```
//!
//! ## Architecture
//!
//! - [`config`]: static settings plus the lock-free [`config::store::ConfigStore`] overlay
//! - [`model`]: the inbound event contract
//! - [`aggregator`]: window batch, layer rollups, trace selection, analytics sizing
//! - [`coordinator`]: single-consumer fan-in loop
//! - [`flusher`]: flush protocol and feature negotiation
//! - [`payload`]: serialized wire structures
//! - [`transport`]: HTTP delivery
//! - [`host`]: host identity resolution

#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![allow(clippy::module_name_repetitions)]

pub mod aggregator;
pub mod config;
pub mod constants;
pub mod coordinator;
pub mod errors;
pub mod flusher;
pub mod host;
pub mod logger;
pub mod model;
pub mod payload;
pub mod transport;

/// Agent name reported in payload headers and the `agent_name` query parameter.
pub const AGENT_NAME: &str = "Rust";

/// Language the runtime layer and host-info payload are attributed to.
pub const AGENT_LANGUAGE: &str = "Rust";

/// Agent version reported in payload headers and the `agent_version` query parameter.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
