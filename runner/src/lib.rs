//! Reconciles the loader entitlements embedded in an installed application's
//! main executable: read what is there, compare against what the loader
//! needs, re-sign only that executable when they differ, then read back and
//! verify.

pub mod codesign;
pub mod entitlements;
pub mod evidence;
pub mod json_contract;
pub mod reader;
pub mod settings;
pub mod target;
pub mod workflow;
pub mod writer;
