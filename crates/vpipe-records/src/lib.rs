//! Video record repository.
//!
//! The pipeline talks to records only through [`VideoRepository`]. Two backends:
//! - [`FirestoreVideoRepository`] over the Firestore REST API
//! - [`MemoryVideoRepository`] for local development and tests

pub mod error;
pub mod firestore;
pub mod memory;
pub mod repository;

pub use error::{RecordError, RecordResult};
pub use firestore::{FirestoreClient, FirestoreConfig, FirestoreVideoRepository};
pub use memory::MemoryVideoRepository;
pub use repository::{StatusChange, VideoRepository};
