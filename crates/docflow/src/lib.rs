pub mod broker;
pub mod capability;
pub mod config;
pub mod db;
pub mod detector;
pub mod error;
pub mod pipeline;
pub mod retry;
pub mod status;
pub mod store;
pub mod submit;
pub mod telemetry;
pub mod worker;

pub use broker::{Broker, MemoryBroker, Topic};
pub use capability::{ModelCatalog, ModelInvoker, PageAnalyzer};
pub use config::{load_config, load_config_with_env, Config};
pub use detector::{CompletionDetector, SweepReport, SweepScheduler};
pub use error::{
    BrokerError, CapabilityError, ConfigError, DocflowError, Result, ValidationError, WorkerError,
};
pub use pipeline::{open_store, Capabilities, HealthReport, Pipeline};
pub use retry::RetryPolicy;
pub use status::{JobHistory, JobStatusView, StatusService};
pub use store::{JobStatus, JobStore, StoreError};
pub use submit::{Submission, Submitter};
