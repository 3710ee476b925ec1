//! Ingestion and transcode orchestration.
//!
//! - [`UploadCoordinator`] issues presigned upload URLs and creates records
//! - [`JobPublisher`] hands jobs to the transcoding workers
//! - [`ProgressRelay`] consumes worker status messages, fans them out to live
//!   subscribers and finalizes record status

pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod publisher;
pub mod registry;
pub mod relay;

pub use config::PipelineConfig;
pub use coordinator::{UploadCoordinator, UploadTicket};
pub use error::{PipelineError, PipelineResult};
pub use publisher::JobPublisher;
pub use registry::{DeliveryReport, Subscription, SubscriptionRegistry};
pub use relay::ProgressRelay;
