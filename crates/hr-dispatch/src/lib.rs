//! HookRelay Dispatcher
//!
//! Drives one inbound webhook through its lifecycle:
//!
//! ```text
//! received -> verifying -> rejected
//!                       -> acknowledged -> processing -> completed | failed
//! ```
//!
//! Verification and the payload shape check run inline so the caller can
//! answer the source immediately. Everything after acknowledgment runs in
//! a detached task; its outcome is visible only through logs, metrics and
//! `DispatchReport`s.

pub mod dispatcher;
pub mod metrics;

pub use dispatcher::{DispatchOutcome, DispatchReport, DispatchState, Dispatcher};
