#![deny(dead_code)]

pub mod config;
pub mod domains;
pub mod logging;
pub mod shared;

pub use config::OrchestratorConfig;
pub use domains::merge::{MergeEngine, MergeOptions, MergeStrategy};
pub use domains::sessions::entity::{Phase, Session, TaskStatus, ThreadType};
pub use domains::sessions::phases::{determine_phase, PhaseDetector};
pub use domains::sessions::registry::{InMemoryRegistry, RegistrySnapshot, SessionRegistry};
pub use domains::sessions::service::SessionService;
pub use shared::cache::GitStateCache;
pub use shared::state_machine::StateMachine;
