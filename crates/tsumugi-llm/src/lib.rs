pub mod anthropic;
pub mod sink;
pub mod sse;
