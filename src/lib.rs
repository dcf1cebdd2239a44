// Library exports for agentvisor: task scheduling, process supervision and workflow reliability

pub mod config;
pub mod error;
pub mod logging;
pub mod process;
pub mod reliability;
pub mod scheduler;
pub mod store;

pub use config::AgentvisorConfig;
pub use error::{AgentvisorError, Result};
pub use process::ProcessSupervisor;
pub use reliability::ReliabilityManager;
pub use scheduler::{DependencyScheduler, PatternLibrary};
pub use store::{FileStateStore, MemoryStateStore, StateStore};
