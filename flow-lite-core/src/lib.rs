//! flow-lite-core: a BPMN-style workflow execution engine.
//!
//! A process definition (nodes, guarded edges, candidate-assignment rules,
//! forms) is loaded from BPMN XML into an immutable [`graph::ProcessGraph`].
//! The [`engine::FlowEngine`] drives instances through that graph:
//! completing a node instance evaluates the outgoing guards, traverses
//! gateways, parks branches at parallel joins, rewinds along back-edges,
//! and materialises the next work items with their resolved candidate sets.
//! A [`timer::TimerScheduler`] advances instances past timer nodes.
//!
//! Persistence and expression evaluation are pluggable: the engine consumes
//! a [`store::FlowStore`] and an [`eval::Evaluator`].

pub mod bpmn;
pub mod engine;
pub mod error;
pub mod eval;
pub mod graph;
pub mod router;
pub mod store;
pub mod store_memory;
#[cfg(feature = "postgres")]
pub mod store_postgres;
pub mod timer;
pub mod types;

pub use engine::{Clock, FlowEngine, SystemClock};
pub use error::{EvalError, FlowError, Result};
pub use eval::{Evaluator, RhaiEvaluator};
pub use router::TIMER_PROCESSOR;
pub use store::FlowStore;
pub use store_memory::MemoryStore;
pub use timer::{TimerScheduler, DEFAULT_TIMER_INTERVAL};
pub use types::*;
