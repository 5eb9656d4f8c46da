//! imgforge-lib: Core types and logic for imgforge
//!
//! This crate provides the building blocks of an imgforge build:
//! - `Registry`: every declared target, keyed by qualified name
//! - `BuildGraph`: the registry with references resolved into strong ids
//! - `Rule`: what a target evaluates to, one variant per rule kind
//! - `Engine`: parallel, memoized evaluation of a graph into artifacts
//! - `image`: CP/M, D64 and ImageDisk encoders

pub mod artifact;
pub mod cache;
pub mod consts;
pub mod eval;
pub mod execute;
pub mod graph;
pub mod image;
pub mod items;
pub mod lua;
pub mod output;
pub mod registry;
pub mod rule;
pub mod target;
pub mod util;
