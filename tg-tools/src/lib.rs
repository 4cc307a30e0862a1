//! Tool capability for toolgate.
//!
//! Tools are looked up by name in a [`ToolRegistry`] and classified by name
//! alone through [`ToolClassifier`]; the approval decision never depends on
//! the implementation behind the name.

mod classifier;
mod error;
mod filesystem;
mod registry;
mod traits;

pub use classifier::{DEFAULT_SAFE_TOOLS, RiskTier, ToolClassifier};
pub use error::{Result, ToolError};
pub use filesystem::{ListDirTool, ReadFileTool, SearchFilesTool, Workspace, WriteFileTool};
pub use registry::ToolRegistry;
pub use traits::{Tool, ToolSpec};
