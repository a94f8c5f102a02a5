//! Resilience helpers.
//!
//! # Data Flow
//! ```text
//! Rule failed to fully open:
//!     → backoff.rs (delay grows with consecutive failures, capped)
//!     → rules check retries the rule once the delay has passed
//! ```
//!
//! # Design Decisions
//! - Exponential growth with a cap at the rules check interval
//! - Jitter spreads retries of rules that failed together

pub mod backoff;
