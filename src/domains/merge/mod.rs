pub mod audit;
pub mod categorize;
pub mod service;
pub mod types;

pub use service::MergeEngine;
pub use types::{
    BlockReason, FileCategory, IntegrationOutcome, MergeOptions, MergePreview, MergeStrategy,
    Mergeability, ResolutionStrategy, SmartMergeReport,
};
