//! Core domain models.
//!
//! This module contains the harvested record types carried on the event bus
//! and written to storage.

pub mod records;

pub use records::*;
