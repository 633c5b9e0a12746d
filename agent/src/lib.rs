//! Autonomous, operator-gated assessment loop.
//!
//! An external planner proposes one shell command per iteration toward an
//! objective; every proposal is classified, gated, executed inside the active
//! session and folded back into the planner's context. The architecture keeps
//! a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (risk classification, approval
//!   policy, target scope, planner context). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (process execution, session
//!   directories, audit log, planner transport). Isolated behind traits so the
//!   loop can be driven by scripted doubles in tests.
//!
//! [`agent_loop`] coordinates the two as an explicit state machine.

pub mod agent_loop;
pub mod core;
pub mod errors;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
