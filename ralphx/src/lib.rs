//! RalphX — an iterative LLM loop orchestrator.
//!
//! Drives declaratively configured **loops** that repeatedly invoke an
//! external LLM CLI over a project workspace: generator loops produce work
//! items, consumer loops claim and process them, and everything in between
//! (prompt assembly, credential injection, stale-claim recovery, resource
//! versioning) is owned by the modules below. This crate is the "hard
//! core" — the HTTP API, OAuth browser flow, and terminal front-end are
//! external collaborators this crate exposes contracts for but does not
//! implement.
//!
//! # Modules
//!
//! - [`domain`] - loop configuration types and validation
//! - [`claim`] - work-item claim engine and dependency graph
//! - [`llm`] - subprocess LLM adapter
//! - [`credential`] - credential orchestration and refresh
//! - [`resources`] - prompt-augmenting resource sync and versioning
//! - [`prompt`] - prompt template assembly
//! - [`loop_engine`] - per-iteration scheduling (the Loop Executor)
//! - [`events`] - run-lifecycle event bus
//! - [`doctor`] - stale-run detection and cleanup
//! - [`cli`] - command-line interface

pub mod claim;
pub mod cli;
pub mod credential;
pub mod doctor;
pub mod domain;
pub mod events;
pub mod llm;
pub mod loop_engine;
pub mod prompt;
pub mod resources;

pub use claim::{ClaimEngine, ClaimError, DependencyGraph};
pub use credential::{CredentialError, CredentialManager};
pub use doctor::{Doctor, DoctorFinding, StaleReason};
pub use domain::{ConfigError, LoopConfig, LoopType};
pub use events::{EventBus, EventEmitter, RunEvent, create_event_bus};
pub use llm::{ClaudeCliAdapter, ExecuteRequest, ExecutionResult, LlmAdapter, StopSignal};
pub use loop_engine::{LoopError, LoopExecutor, PauseGate, RunOutcome, StopHandle, StopReason};
pub use resources::{ResourceError, ResourceManager};
