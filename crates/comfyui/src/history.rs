//! Interpretation of ComfyUI `/history/{prompt_id}` responses.
//!
//! A history entry looks like:
//!
//! ```json
//! {
//!   "<prompt_id>": {
//!     "outputs": { "9": { "images": [{"filename": "a.png", "subfolder": "", "type": "output"}] } },
//!     "status": { "status_str": "success", "completed": true, "messages": [] }
//!   }
//! }
//! ```

use charforge_core::job::RemoteArtifact;
use serde_json::Value;

/// Output lists checked first, in this order, before any other list.
const PREFERRED_OUTPUT_KEYS: [&str; 3] = ["images", "gifs", "videos"];

/// Progress of a remote job as reported by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    Pending,
    Succeeded(RemoteArtifact),
    Failed(String),
}

/// Interpret the history response for `prompt_id`.
pub fn parse_history(prompt_id: &str, history: &Value) -> RemoteStatus {
    let Some(entry) = history.get(prompt_id) else {
        return RemoteStatus::Pending;
    };

    let status = entry.get("status");
    let status_str = status
        .and_then(|s| s.get("status_str"))
        .and_then(Value::as_str);

    if status_str == Some("error") {
        return RemoteStatus::Failed(execution_error_message(status));
    }

    let completed = status
        .and_then(|s| s.get("completed"))
        .and_then(Value::as_bool)
        // Older builds omit `status` and only write history once finished.
        .unwrap_or(status.is_none());

    if !completed {
        return RemoteStatus::Pending;
    }

    match entry.get("outputs").and_then(first_output_file) {
        Some(artifact) => RemoteStatus::Succeeded(artifact),
        None => RemoteStatus::Failed("no output produced".to_string()),
    }
}

/// Extract the `exception_message` from an `execution_error` status message.
fn execution_error_message(status: Option<&Value>) -> String {
    status
        .and_then(|s| s.get("messages"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|message| {
            let pair = message.as_array()?;
            if pair.first()?.as_str()? != "execution_error" {
                return None;
            }
            let data = pair.get(1)?;
            let text = data.get("exception_message")?.as_str()?;
            let node = data.get("node_type").and_then(Value::as_str);
            Some(match node {
                Some(node) => format!("{node}: {}", text.trim()),
                None => text.trim().to_string(),
            })
        })
        .next()
        .unwrap_or_else(|| "execution error".to_string())
}

/// First output file across all output nodes, ordered by node id.
fn first_output_file(outputs: &Value) -> Option<RemoteArtifact> {
    let nodes = outputs.as_object()?;

    for key in PREFERRED_OUTPUT_KEYS {
        if let Some(artifact) = nodes
            .values()
            .filter_map(|node| node.get(key))
            .find_map(first_file_in_list)
        {
            return Some(artifact);
        }
    }

    nodes
        .values()
        .filter_map(Value::as_object)
        .flat_map(|node| node.values())
        .find_map(first_file_in_list)
}

fn first_file_in_list(list: &Value) -> Option<RemoteArtifact> {
    list.as_array()?
        .iter()
        .find_map(|item| serde_json::from_value::<FileRef>(item.clone()).ok())
        .filter(|file| !file.filename.is_empty())
        .map(|file| RemoteArtifact {
            filename: file.filename,
            subfolder: file.subfolder,
            folder_type: file.folder_type,
        })
}

#[derive(serde::Deserialize)]
struct FileRef {
    filename: String,
    #[serde(default)]
    subfolder: String,
    #[serde(rename = "type", default = "default_type")]
    folder_type: String,
}

fn default_type() -> String {
    "output".to_string()
}
