//! The event pipeline: risk scoring, capture filtering, session batching,
//! local staging and retrying upload to the collector.

pub mod aggregator;
pub mod filter;
pub mod risk;
pub mod store;
pub mod uploader;
pub mod wire;

pub use aggregator::{SessionAggregator, SessionSnapshot};
pub use filter::{FilterChain, FilterRules, FilterStatistics};
pub use risk::{RiskConfig, RiskScorer};
pub use store::{BatchStore, FileBatchStore, MemoryBatchStore, StoreError};
pub use uploader::{
    BatchUploader, CollectorTransport, HttpCollector, UploadError, UploaderConfig,
    UPLOAD_CHANNEL_CAPACITY,
};
pub use wire::{BatchUpload, EventWire};
