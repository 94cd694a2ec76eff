pub mod registry;
pub mod tool;

pub use registry::{ToolError, ToolMetrics, ToolRegistry};
pub use tool::{Tool, ToolArgs};
