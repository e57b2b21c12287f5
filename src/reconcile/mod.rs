//! Edit-reconciliation: single-flight generation, merge and re-merge on edit.

pub mod controller;
pub mod gate;
pub mod notice;
pub mod state;

pub use controller::{Controller, Outcome, SkipReason, spawn_event_loop};
pub use gate::{GateGuard, GenerationGate, SuppressionWindow};
pub use notice::{Notice, NoticeBus, NoticeLevel};
pub use state::MessagePhase;
