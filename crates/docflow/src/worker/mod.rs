pub mod aggregation;
pub mod page;
pub mod pool;

pub use aggregation::{AggregationOutcome, AggregationPolicies, AggregationWorker};
pub use page::{PageOutcome, PageWorker};
pub use pool::{DeliveryHandler, Disposition, WorkerPool};
