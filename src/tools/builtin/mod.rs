//! Built-in tools exposed to tool-execution sessions.

pub mod complete;
pub mod file;
pub mod shell;

pub use complete::{COMPLETE_TASK, CompleteTaskTool, Completion};
pub use file::{EditFileTool, ReadFileTool, WriteFileTool};
pub use shell::RunCommandTool;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::tools::ToolRegistry;

/// Registry with the file, shell and completion tools rooted at `workdir`.
pub fn session_registry(workdir: &Path, command_timeout: Duration) -> ToolRegistry {
    ToolRegistry::new()
        .with(Arc::new(ReadFileTool::new(workdir)))
        .with(Arc::new(WriteFileTool::new(workdir)))
        .with(Arc::new(EditFileTool::new(workdir)))
        .with(Arc::new(
            RunCommandTool::new(workdir).with_timeout(command_timeout),
        ))
        .with(Arc::new(CompleteTaskTool))
}
