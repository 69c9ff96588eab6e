//! DICOM Bridge: an adapter between clinical DICOM networks and an
//! inference platform.
//!
//! Incoming objects pushed by modalities and PACS systems are received by a
//! store service class provider ([`ingest`]), grouped into units of work
//! ([`grouping`]) and submitted as jobs ([`platform`]). Inference requests
//! received from the outside are persisted ([`inference`]), their input data
//! retrieved from remote DICOM nodes ([`retrieve`]) and submitted through
//! the same job path.

pub mod config;
pub mod dimse;
pub mod error;
pub mod grouping;
pub mod inference;
pub mod ingest;
pub mod platform;
pub mod registry;
pub mod retrieve;
pub mod storage;
pub mod types;

/// The default application entity title of this adapter.
pub const DEFAULT_AET: &str = "DICOM-BRIDGE";
