//! Local capabilities offered to the model, served over an in-process MCP
//! connection.

use parley_core::tools::McpToolExecutor;
use rmcp::{
    ServerHandler, ServiceExt,
    handler::server::{router::tool::ToolRouter, tool::Parameters},
    model::{ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
};
use schemars::JsonSchema;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Files larger than this are truncated when read.
const MAX_READ_BYTES: usize = 64 * 1024;

/// Arguments for tools that operate on a single path.
#[derive(Deserialize, JsonSchema, Debug)]
pub struct PathArgs {
    /// Path to operate on. Relative paths are resolved against the workspace root.
    #[schemars(description = "File or directory path, absolute or relative to the workspace root")]
    pub path: String,
}

/// Filesystem and clock tools rooted at one directory.
pub struct LocalToolbox {
    root: PathBuf,
    tool_router: ToolRouter<Self>,
}

#[tool_handler]
impl ServerHandler for LocalToolbox {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

#[tool_router]
impl LocalToolbox {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            tool_router: Self::tool_router(),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    #[tool(description = "Get the current local date and time in RFC 3339 format.")]
    pub async fn get_current_time(&self) -> Result<String, String> {
        info!("Executing tool 'get_current_time'");
        Ok(chrono::Local::now().to_rfc3339())
    }

    #[tool(description = "Read a UTF-8 text file and return its contents.")]
    pub async fn read_text_file(&self, args: Parameters<PathArgs>) -> Result<String, String> {
        info!(path = %args.0.path, "Executing tool 'read_text_file'");
        let path = self.resolve(&args.0.path);
        let mut text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| format!("Failed to read '{}': {}", path.display(), e))?;
        if text.len() > MAX_READ_BYTES {
            let mut cut = MAX_READ_BYTES;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
            text.push_str("\n[truncated]");
        }
        Ok(text)
    }

    #[tool(description = "List the entries of a directory. Directory names end with '/'.")]
    pub async fn list_directory(&self, args: Parameters<PathArgs>) -> Result<String, String> {
        info!(path = %args.0.path, "Executing tool 'list_directory'");
        let path = self.resolve(&args.0.path);
        let mut reader = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| format!("Failed to list '{}': {}", path.display(), e))?;

        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await.map_err(|e| e.to_string())? {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                name.push('/');
            }
            entries.push(name);
        }
        entries.sort();
        serde_json::to_string(&entries).map_err(|e| e.to_string())
    }

    #[tool(description = "Permanently delete a file. Requires user confirmation.")]
    pub async fn delete_file(&self, args: Parameters<PathArgs>) -> Result<String, String> {
        warn!(path = %args.0.path, "Executing tool 'delete_file'");
        let path = self.resolve(&args.0.path);
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| format!("Failed to delete '{}': {}", path.display(), e))?;
        Ok(format!("OK. Deleted '{}'.", path.display()))
    }
}

/// Serves a [`LocalToolbox`] on an in-memory duplex pipe and returns an
/// executor connected to it.
pub async fn spawn_local_tools(root: impl Into<PathBuf>) -> anyhow::Result<McpToolExecutor> {
    let toolbox = LocalToolbox::new(root);
    let (server_transport, client_transport) = tokio::io::duplex(4096);

    tokio::spawn(async move {
        match toolbox.serve(server_transport).await {
            Ok(service) => {
                let _ = service.waiting().await;
            }
            Err(e) => warn!(error = %e, "Local tool server failed to start"),
        }
    });
    let client = ().serve(client_transport).await?;
    Ok(McpToolExecutor::new(client))
}
