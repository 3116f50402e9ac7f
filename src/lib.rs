//! Fish-oil supply-chain provenance core.
//!
//! This crate provides:
//! - Dual (SHA-256 + BLAKE3) hashing and hash-chained stage receipts
//! - A fifteen-field schema and per-stage validation
//! - A rule-table fraud engine with FLAG / REJECT / HALT verdicts
//! - An append-only, file-locked JSON-lines ledger with halt state
//! - Chain verification, per-lot verification and BLAKE3 Merkle proofs
//! - Consumer QR payloads and offline verification packs (JSON)
//!
//! [`pipeline::Pipeline`] ties the pieces together for multi-lot ingestion.

#![deny(unsafe_code)]

pub mod error;
pub mod config;
pub mod logging;

pub mod fields;
pub mod fraud;
pub mod hash;
pub mod ledger;
pub mod merkle;
pub mod pipeline;
pub mod receipt;
pub mod report;
pub mod schema;
pub mod stage;
pub mod util;
pub mod verify;
