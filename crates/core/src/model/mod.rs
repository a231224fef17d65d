pub mod edge;
pub mod raw_log;
pub mod span;
pub mod trace;

pub use edge::DependencyEdgeRow;
pub use raw_log::RawLogRow;
pub use span::SpanRow;
pub use trace::TraceRow;
