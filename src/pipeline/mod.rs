//! Harvest pipeline.
//!
//! - `partition`: deal search terms to polling workers
//! - `worker`: buffer, flush policy and the crawl loop
//! - `run_harvest`: start every worker, wait, release storage

pub mod buffer;
pub mod flush;
pub mod harvest;
pub mod partition;
pub mod worker;

pub use buffer::PostBuffer;
pub use flush::FlushPolicy;
pub use harvest::{HarvestReport, Sources, run_harvest};
pub use partition::{TermAssignment, partition};
pub use worker::{
    CrawlWorker, PollingSupplier, PostSupplier, StreamingSupplier, WorkerContext, WorkerReport,
    WorkerState,
};
