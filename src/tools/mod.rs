//! Tool system modules and re-exports.

// === Modules ===

pub mod assembler;
pub mod context;
pub mod file;
pub mod helpers;
pub mod mcp_tool;
pub mod registry;
pub mod schema;
pub mod search;
pub mod shell;
pub mod spec;
pub mod subagent;
pub mod todo;

// === Re-exports ===

pub use assembler::{BuiltinTools, ToolAssembler};
pub use registry::{RegisteredTool, TOOL_ID_SEPARATOR, ToolRegistry, split_tool_id, tool_id};
pub use schema::{GeminiSchemaAdapter, JsonSchemaConverter, SchemaAdapter, SchemaConverter, ToolSchema};
pub use spec::{ToolContext, ToolError, ToolResult, ToolSpec};
pub use subagent::SubagentRunner;
pub use todo::{SharedTodoStore, TodoStore};
