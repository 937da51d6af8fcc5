// ===============================
// src/lib.rs
// ===============================
/*
=============================================================================
Project : fleet_bot_rust - per-symbol autonomous trading fleet control plane
Module  : lib.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Runs one decide-and-act worker per symbol, gates every trade
          through a shared drawdown circuit breaker, executes through a
          serialized broker session, supervises worker health, exposes
          Prometheus metrics, and records JSONL events.
=============================================================================
*/
pub mod broker;
pub mod config;
pub mod domain;
pub mod execution;
pub mod fleet;
pub mod gateway; // paper venue (simulated fills, SL/TP)
pub mod metrics;
pub mod recorder;
pub mod risk;
pub mod signal;
pub mod strategy;
pub mod supervisor;
pub mod worker;

#[cfg(test)]
mod testkit;
