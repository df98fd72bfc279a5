// src/lib.rs

//! Harvester library: buffered, deduplicated ingestion of microblog posts
//! into a two-tier store.

pub mod error;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod storage;
