//! `fleet-engine`: coordination of the worker fleet.
//!
//! - [`distributor`]: spreading work items over workers, swaps, rebalancing
//! - [`worker`]: one live worker servicing its queue partition
//! - [`manager`]: supervising units and running the maintenance schedule
//! - [`scheduler`]: jittered periodic tasks
//! - [`onboarding`]: the two-step worker login
//! - [`profile`]: mirroring an item's identity onto its worker

pub mod distributor;
pub mod manager;
pub mod onboarding;
pub mod profile;
pub mod scheduler;
pub mod worker;

pub use distributor::{
    CrossSwapStats, DistributionReport, DistributionStats, Distributor, FailureOutcome,
    RebalanceStats, WorkerLoad,
};
pub use manager::{
    DistributeSummary, FleetServices, ManagerConfig, ManagerStats, RebalanceSummary, SyncReport,
    WorkerManager, WorkerStartError,
};
pub use onboarding::{Onboarding, OnboardingError};
pub use profile::{NoopProfileSync, ProfileSync, TransportProfileSync};
pub use scheduler::{ScheduledTask, Scheduler, SchedulerError, SchedulerStats, TaskStats};
pub use worker::{ServiceAssignment, UnitDeps, WorkerUnit, routing_key};
