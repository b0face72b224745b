//! Node dispatch: handlers, degradation stubs and runtime events

pub mod events;
pub mod handler;
pub mod node_executor;
pub mod stubs;

pub use events::{BufferingEventSink, EventEmitter, EventEnvelope, EventSink, LoggingEventSink, RuntimeEvent};
pub use handler::{FnHandler, HandlerRegistry, NodeContext, NodeHandler, NodeOutput};
pub use node_executor::{
    FallbackOutcome, NodeError, NodeErrorKind, NodeExecutor, NodeResult, ResultStatus,
};
pub use stubs::stub_output;
