//! Regime-adaptive strategy orchestration with a session risk gate.
//!
//! Each cycle a symbol's snapshot is classified into a market regime, the
//! best-performing eligible strategy for that regime is selected from the
//! performance ledger, and any entry or hold passes through the shared
//! risk gate before reaching the execution venue.

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod feed;
pub mod indicators;
pub mod ledger;
pub mod lifecycle;
pub mod logging;
pub mod market;
pub mod position;
pub mod regime;
pub mod risk;
pub mod selector;
pub mod storage;
pub mod strategies;
pub mod strategy;
