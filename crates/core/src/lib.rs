//! `fleet-core`: domain building blocks for the worker fleet.
//!
//! This crate contains **pure domain** primitives: identifiers, entities and
//! their state transitions. Storage, transport and scheduling live elsewhere.

pub mod assignment;
pub mod campaign;
pub mod entity;
pub mod error;
pub mod id;
pub mod work_item;
pub mod worker;

pub use assignment::{Assignment, AssignmentStatus, MAX_FAILS_BEFORE_SWAP};
pub use campaign::{Campaign, CampaignSchedule, CampaignStatus};
pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{AssignmentId, CampaignId, OwnerId, WorkItemId, WorkerId};
pub use work_item::{WorkItem, WorkItemStatus, parse_handle};
pub use worker::{Worker, WorkerLimits, WorkerStatus};
