//! The Davit policy control loop.
//!
//! Three components do the work:
//! - [`CheckRunner`] couples one check's metric query with its strategy and
//!   caps the resulting action to the policy's bounds
//! - [`PolicyHandler`] owns one policy end-to-end: it ticks on the policy's
//!   evaluation interval, fans out check runners, picks a winning action,
//!   and sequences Idle → WaitingTurn → Scaling → Cooldown
//! - [`PolicyManager`] reconciles the set of running handlers against the
//!   ID streams of every configured policy source
//!
//! Scaling concurrency is bounded by a shared [`SlotLimiter`].

#![forbid(unsafe_code)]

mod check;
mod error;
mod eval;
mod handler;
mod limiter;
mod manager;
mod winner;

pub use check::CheckRunner;
pub use error::{CoreError, Result};
pub use eval::{CheckOutcome, ScalingEvaluation};
pub use handler::{HandlerState, HandlerStateHandle, PolicyHandler, cooldown_remaining};
pub use limiter::{SlotLimiter, SlotPermit};
pub use manager::{ManagerConfig, PolicyManager};
pub use winner::select_winner;
