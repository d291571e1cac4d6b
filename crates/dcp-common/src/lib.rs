//! DCP Common Library
//!
//! Shared utilities for the DCP (document crawl platform) workspace members:
//!
//! - **Logging**: centralized tracing bootstrap with env-based configuration
//! - **Hashing**: URI digest helpers used by the ingest-state schema
pub mod hash;
pub mod logging;
