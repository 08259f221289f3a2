pub mod process;
pub mod registry;
pub mod tool;
pub mod tools;

pub use process::{ProcessOutput, ToolCommand};
pub use registry::ToolRegistry;
pub use tool::{
    content_type_for, BinaryStatus, OutputFile, ToolAdapter, ToolContext, ToolError, ToolOutput, ToolRequest,
    ToolStatus,
};
pub use tools::{FetchAdapter, OcrAdapter, RenderAdapter, TranscodeAdapter};
