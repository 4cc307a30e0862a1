use crate::error::{Result, ToolError};
use crate::traits::{Tool, ToolSpec, required_arg, string_arg};
use async_trait::async_trait;
use regex::Regex;
use serde_json::json;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

const SEARCH_RESULTS_MAX: usize = 200;
const FILE_BYTES_MAX: usize = 1_000_000;
const SEARCH_STEPS_MAX: usize = 50_000;

/// Directory every filesystem tool is confined to.
#[derive(Debug, Clone)]
pub struct Workspace {
    root_dir: PathBuf,
}

impl Workspace {
    pub fn new(root_dir: impl AsRef<Path>) -> Result<Arc<Self>> {
        let root_dir = root_dir.as_ref().to_path_buf();
        if root_dir.as_os_str().is_empty() {
            return Err(ToolError::InvalidArguments(
                "root_dir is required".to_string(),
            ));
        }
        Ok(Arc::new(Self { root_dir }))
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// All four tools sharing this workspace.
    pub fn tools(self: &Arc<Self>) -> Vec<Arc<dyn Tool>> {
        vec![
            Arc::new(ReadFileTool::new(self.clone())),
            Arc::new(ListDirTool::new(self.clone())),
            Arc::new(SearchFilesTool::new(self.clone())),
            Arc::new(WriteFileTool::new(self.clone())),
        ]
    }

    fn resolve(&self, user_path: &str) -> Result<PathBuf> {
        let rel = Path::new(user_path);
        if rel.is_absolute() {
            return Err(ToolError::OutsideWorkspace(
                "absolute paths are not allowed".to_string(),
            ));
        }
        for component in rel.components() {
            match component {
                Component::ParentDir => {
                    return Err(ToolError::OutsideWorkspace(
                        "path traversal is not allowed".to_string(),
                    ));
                }
                Component::CurDir | Component::Normal(_) => {}
                Component::RootDir | Component::Prefix(_) => {
                    return Err(ToolError::OutsideWorkspace("invalid path".to_string()));
                }
            }
        }
        Ok(self.root_dir.join(rel))
    }

    fn relative(&self, path: &Path) -> Option<String> {
        path.strip_prefix(&self.root_dir)
            .ok()
            .map(|rel| rel.to_string_lossy().to_string())
    }
}

fn path_schema(extra: serde_json::Value) -> serde_json::Value {
    let mut properties = serde_json::Map::new();
    properties.insert(
        "path".to_string(),
        json!({ "type": "string", "description": "Path relative to the workspace root." }),
    );
    if let serde_json::Value::Object(extra) = extra {
        properties.extend(extra);
    }
    json!({
        "type": "object",
        "additionalProperties": false,
        "properties": properties,
        "required": ["path"]
    })
}

pub struct ReadFileTool {
    workspace: Arc<Workspace>,
}

impl ReadFileTool {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "read_file".to_string(),
            description: "Read a UTF-8 text file from the workspace.".to_string(),
            parameters_schema: path_schema(json!({})),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value> {
        let path = required_arg(&arguments, "path")?;
        let resolved = self.workspace.resolve(&path)?;
        let bytes = tokio::fs::read(&resolved).await?;
        if bytes.len() > FILE_BYTES_MAX {
            return Err(ToolError::TooLarge {
                what: "file",
                bytes: bytes.len(),
                max: FILE_BYTES_MAX,
            });
        }
        Ok(json!({ "path": path, "content": String::from_utf8_lossy(&bytes) }))
    }
}

pub struct WriteFileTool {
    workspace: Arc<Workspace>,
}

impl WriteFileTool {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "write_file".to_string(),
            description: "Create or overwrite a text file in the workspace.".to_string(),
            parameters_schema: path_schema(json!({ "content": { "type": "string" } })),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value> {
        let path = required_arg(&arguments, "path")?;
        let content = required_arg(&arguments, "content")?;
        if content.len() > FILE_BYTES_MAX {
            return Err(ToolError::TooLarge {
                what: "content",
                bytes: content.len(),
                max: FILE_BYTES_MAX,
            });
        }
        let resolved = self.workspace.resolve(&path)?;
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&resolved, &content).await?;
        Ok(json!({ "path": path, "bytes_written": content.len() }))
    }
}

pub struct ListDirTool {
    workspace: Arc<Workspace>,
}

impl ListDirTool {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "list_dir".to_string(),
            description: "List entries of a workspace directory.".to_string(),
            parameters_schema: path_schema(json!({})),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value> {
        let path = string_arg(&arguments, "path")?.unwrap_or_else(|| ".".to_string());
        let resolved = self.workspace.resolve(&path)?;
        let mut entries = Vec::new();
        let mut rd = tokio::fs::read_dir(&resolved).await?;
        while let Some(entry) = rd.next_entry().await? {
            entries.push(entry.file_name().to_string_lossy().to_string());
            if entries.len() >= SEARCH_RESULTS_MAX {
                break;
            }
        }
        entries.sort();
        Ok(json!({ "path": path, "entries": entries }))
    }
}

pub struct SearchFilesTool {
    workspace: Arc<Workspace>,
}

impl SearchFilesTool {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }

    async fn search(&self, start: &Path, regex: &Regex) -> Result<Vec<String>> {
        let mut stack = vec![start.to_path_buf()];
        let mut out = Vec::new();
        let mut steps = 0usize;

        while let Some(dir) = stack.pop() {
            steps += 1;
            if steps >= SEARCH_STEPS_MAX {
                tracing::warn!(steps, "search_files step budget exhausted");
                break;
            }
            let Ok(mut rd) = tokio::fs::read_dir(&dir).await else {
                continue;
            };
            while let Some(entry) = rd.next_entry().await? {
                let p = entry.path();
                let Ok(meta) = entry.metadata().await else {
                    continue;
                };
                if meta.is_dir() {
                    stack.push(p);
                    continue;
                }
                if !meta.is_file() {
                    continue;
                }
                let name = p.file_name().and_then(|s| s.to_str()).unwrap_or("");
                if regex.is_match(name) {
                    if let Some(rel) = self.workspace.relative(&p) {
                        out.push(rel);
                    }
                    if out.len() >= SEARCH_RESULTS_MAX {
                        out.sort();
                        return Ok(out);
                    }
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

#[async_trait]
impl Tool for SearchFilesTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "search_files".to_string(),
            description: "Recursively find workspace files whose name matches a regex."
                .to_string(),
            parameters_schema: path_schema(json!({ "pattern": { "type": "string" } })),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value> {
        let path = required_arg(&arguments, "path")?;
        let pattern = string_arg(&arguments, "pattern")?.unwrap_or_else(|| ".*".to_string());
        let regex = Regex::new(&pattern)
            .map_err(|e| ToolError::InvalidArguments(format!("invalid regex: {e}")))?;
        let resolved = self.workspace.resolve(&path)?;
        let matches = self.search(&resolved, &regex).await?;
        Ok(json!({ "pattern": pattern, "matches": matches }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_prevents_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let tool = ReadFileTool::new(Workspace::new(tmp.path()).unwrap());
        let err = tool
            .execute(json!({ "path": "../secrets.txt" }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("traversal"));

        let err = tool
            .execute(json!({ "path": "/etc/passwd" }))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::OutsideWorkspace(_)));
    }

    #[tokio::test]
    async fn write_then_read_and_search() {
        let tmp = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(tmp.path()).unwrap();
        let write = WriteFileTool::new(workspace.clone());
        let read = ReadFileTool::new(workspace.clone());
        let search = SearchFilesTool::new(workspace.clone());

        let out = write
            .execute(json!({ "path": "notes/today.md", "content": "ship it" }))
            .await
            .unwrap();
        assert_eq!(out["bytes_written"], json!(7));

        let out = read
            .execute(json!({ "path": "notes/today.md" }))
            .await
            .unwrap();
        assert_eq!(out["content"], json!("ship it"));

        let out = search
            .execute(json!({ "path": ".", "pattern": "\\.md$" }))
            .await
            .unwrap();
        assert_eq!(out["matches"], json!(["notes/today.md"]));
    }

    #[tokio::test]
    async fn list_dir_defaults_to_root() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("b.txt"), "b").unwrap();
        std::fs::write(tmp.path().join("a.txt"), "a").unwrap();
        let tool = ListDirTool::new(Workspace::new(tmp.path()).unwrap());
        let out = tool.execute(json!({})).await.unwrap();
        assert_eq!(out["entries"], json!(["a.txt", "b.txt"]));
    }

    #[tokio::test]
    async fn write_requires_content() {
        let tmp = tempfile::tempdir().unwrap();
        let tool = WriteFileTool::new(Workspace::new(tmp.path()).unwrap());
        let err = tool.execute(json!({ "path": "x.txt" })).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
