//! A hierarchical statechart runtime (XState v5-style semantics) embedded in
//! a message-passing orchestrator that routes events between many
//! concurrently running machines. One `Interpreter` task per machine;
//! `Orchestrator` is the only legitimate path between them.

pub mod context;
pub mod diagnostics;
pub mod error;
pub mod event;
pub mod history;
pub mod intern;
pub mod interpreter;
pub mod mailbox;
pub mod model;
pub mod orchestrator;
pub mod parser;
pub mod path;
pub mod registry;
pub mod snapshot;
pub mod timer;
pub mod topic;

pub use context::{ContextSnapshot, OrchestratedContext, RequestSend};
pub use diagnostics::{Diagnostic, DiagnosticRing};
pub use error::{Result, StatechartError};
pub use event::Event;
pub use interpreter::{Interpreter, InterpreterStatus};
pub use mailbox::{Capacity, OverflowPolicy};
pub use model::{Definition, NodeId};
pub use orchestrator::{Orchestrator, RegisterPolicy, SubscriptionToken};
pub use parser::parse_definition;
pub use registry::ActionGuardRegistry;
pub use snapshot::{Snapshot, Value};
