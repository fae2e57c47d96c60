//! Time-delayed purge of rejected applicants.

mod graph;
mod sweeper;

pub use graph::{deletion_order, EntityKind};
pub use sweeper::{
    PurgeSummary, RetentionSettings, RetentionSweeper, SweepFailure, SweepReport,
    MAX_GRACE_PERIOD_DAYS,
};
