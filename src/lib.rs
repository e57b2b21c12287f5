//! auxmerge: augments transcript messages with auxiliary model output and
//! keeps that output consistent as the primary text is edited.

pub mod config;
pub mod error;
pub mod generator;
pub mod llm;
pub mod lore;
pub mod markers;
pub mod reconcile;
pub mod transcript;
