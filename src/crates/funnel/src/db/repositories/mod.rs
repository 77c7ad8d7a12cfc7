//! Repository pattern implementations for database access
//!
//! Repositories are unit structs with associated async functions taking the
//! pool, one per table family: campaigns, executions, deliveries and failures,
//! the block list and the recent-activity cache.

pub mod activity_repo;
pub mod block_list_repo;
pub mod campaign_repo;
pub mod delivery_repo;
pub mod execution_repo;

pub use activity_repo::ActivityRepository;
pub use block_list_repo::BlockListRepository;
pub use campaign_repo::CampaignRepository;
pub use delivery_repo::DeliveryRepository;
pub use execution_repo::{CounterDelta, ExecutionRepository};
