// src/lib.rs
//! Extraction and reconciliation engine for financial statements published by
//! the Chilean market regulator (CMF).
pub mod cmf;
pub mod config;
pub mod extractors;
pub mod reconcile;
pub mod retrieval;
pub mod storage;
pub mod utils;
