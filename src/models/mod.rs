// src/models/mod.rs

//! Domain models for the harvester.

mod config;
mod post;

pub use config::{
    BackendKind, Config, DurableKind, FileConfig, HarvestConfig, SourceConfig, StorageConfig,
    TieredConfig,
};
pub use post::{Post, RawAuthor, RawPost, SOURCE_TAG_LEN, SourceTag, relevance};

#[cfg(test)]
pub(crate) use post::sample_post;
