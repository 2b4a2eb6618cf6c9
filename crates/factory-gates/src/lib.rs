//! factory-gates: the subprocess side of the factory gateway.
//!
//! Provides the production implementations of the kernel's `GateSuite` and
//! `Executor` traits: the CI/policy gate script invocation with log-hash
//! evidence, the allowed-tests runner, and the codex / opencode-cli
//! executor adapters.

pub mod command;
pub mod executor;
pub mod local;
pub mod suite;

pub use command::{run_command, CommandOutcome};
pub use executor::ProcessExecutor;
pub use local::{LocalMapStore, LocalPackRenderer, SchemaVersionValidator};
pub use suite::{GateConfig, ProcessGateSuite, POLICY_GATE_TRIGGER_PREFIXES};
