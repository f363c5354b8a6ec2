//! # Strata State - Persisted Provisioning State
//!
//! This crate holds the durable record of what the provisioning engine
//! believes is installed, and the storage backends that persist it.
//!
//! ## Overview
//!
//! - **State**: requested and installed features per region, feature
//!   lifecycle states, managed units and their content checksums
//! - **Storage**: load and save a whole [`State`] at once, never partially
//! - **Checksums**: content fingerprints used to detect changed snapshot units
//!
//! ## Architectural Boundaries
//!
//! - **strata-state** owns the shape and persistence of the state document
//! - **strata-deployer** owns every decision about how the state changes
//!
//! Computation always works on a copy; the live value is replaced as a whole
//! once a transaction commits.

#![deny(unsafe_code)]

pub mod checksum;
pub mod error;
pub mod state;
pub mod storage;

pub use checksum::content_checksum;
pub use error::{Result, StateError};
pub use state::{State, add_to_set, remove_from_set};
pub use storage::{FileStateStorage, InMemoryStateStorage, StateStorage};
