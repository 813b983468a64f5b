//! Per-provider LLM request/response parsing (L3) and the streaming
//! accumulator (M2). Every parser is total: malformed input yields `None`,
//! never a panic or an `Err` that could abort the flow it's attached to
//! (spec.md §4.5, §7).

pub mod model;
pub mod registry;
pub mod accumulator;
pub mod providers;

pub use model::{
    ContentBlock, Message, ParsedRequest, ParsedResponse, PartialResponse, BlockKind, Usage,
};
pub use registry::{Parser, ParserRegistry};
pub use accumulator::StreamAccumulator;
