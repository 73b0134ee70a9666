//! Core engine: the scan, compare and persist loop.

pub mod controller;
pub mod report;
pub mod scanner;
pub mod scheduler;

pub use controller::{ControllerState, ConvergenceController, IterationState, PassRunner};
pub use report::{PassOutcome, PassReport, RunSummary, SiteReport, SiteStatus};
pub use scanner::{DealFilter, Scanner, SiteEntry};
pub use scheduler::{Scheduler, SchedulerStats};
