//! Segment orchestration: coordinates the membership store, the random
//! assignment sampler and the expiration scheduler.

pub mod report;
pub mod sampler;
pub mod segments;

pub use report::{Report, ReportWriter};
pub use sampler::{CohortSampler, RandomSampler};
pub use segments::{SegmentService, UpdateSummary};
