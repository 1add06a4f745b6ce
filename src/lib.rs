// src/lib.rs

//! syrvisctl: SyrvisCore service version manager
//!
//! Installs service releases side by side under `versions/`, switches the
//! active one through the `current` symlink, and keeps a manifest of what is
//! installed and how the active version changed over time.
//!
//! # Architecture
//!
//! - Manifest-first: installed versions and history live in one JSON file
//! - Atomic switches: `current` is replaced by rename, never edited in place
//! - Pointer before manifest: a crash between the two is detectable by `verify`
//! - Pluggable sources: GitHub release wheels or a local wheel or bundle
//! - Isolated versions: each wheel gets its own virtualenv
//! - Serialized mutations: one cross-process lock per install root

mod error;
pub mod paths;
pub mod release;
pub mod service;
pub mod store;

pub use error::{Error, Result};
pub use store::{StoreOptions, VersionStore};
