pub mod agent_repo;
pub mod history_repo;
pub mod preparation_repo;

pub use agent_repo::{AgentDirectory, MemoryAgentDirectory, PgAgentDirectory};
pub use history_repo::{NoopPositionHistory, PgPositionHistory, PositionHistory};
pub use preparation_repo::{
    MemoryPreparationRepository, PgPreparationRepository, PreparationRepository,
};
