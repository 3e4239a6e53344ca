pub mod cache;
pub mod state_machine;
