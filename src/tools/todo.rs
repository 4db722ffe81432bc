//! Todo tools and the per-task todo store.
//!
//! The list lives in `<task dir>/.desk-agent/todos.json` so it survives
//! across runs of the same task.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::spec::{ToolContext, ToolError, ToolResult, ToolSpec, optional_bool, optional_str, required_str};

// === Types ===

/// A single todo item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub name: String,
    #[serde(default)]
    pub completed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoList {
    #[serde(default)]
    pub initial_user_prompt: String,
    #[serde(default)]
    pub items: Vec<TodoItem>,
}

impl TodoList {
    /// Compute completion percentage for the list.
    #[must_use]
    pub fn completion_percentage(&self) -> u8 {
        if self.items.is_empty() {
            return 0;
        }
        let total = self.items.len();
        let completed = self.items.iter().filter(|item| item.completed).count();
        let percent = (completed.saturating_mul(100) + total / 2) / total;
        u8::try_from(percent).unwrap_or(u8::MAX)
    }
}

/// File-backed todo list for one task directory.
#[derive(Debug)]
pub struct TodoStore {
    path: PathBuf,
    lock: Mutex<()>,
}

/// Shared reference to a `TodoStore` for use across tools
pub type SharedTodoStore = Arc<TodoStore>;

impl TodoStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Store at the conventional location under `task_dir`.
    pub fn for_task(task_dir: &Path) -> Self {
        Self::new(task_dir.join(".desk-agent").join("todos.json"))
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn read(&self) -> Result<TodoList, ToolError> {
        if !self.path.exists() {
            return Ok(TodoList::default());
        }
        let content = fs::read_to_string(&self.path)
            .map_err(|e| ToolError::execution_failed(format!("Failed to read todos: {e}")))?;
        serde_json::from_str(&content)
            .map_err(|e| ToolError::execution_failed(format!("Failed to parse todos: {e}")))
    }

    fn write(&self, list: &TodoList) -> Result<(), ToolError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ToolError::execution_failed(format!("Failed to create {}: {e}", parent.display())))?;
        }
        let content = serde_json::to_string_pretty(list)
            .map_err(|e| ToolError::execution_failed(e.to_string()))?;
        fs::write(&self.path, content)
            .map_err(|e| ToolError::execution_failed(format!("Failed to write todos: {e}")))
    }

    pub fn load(&self) -> Result<TodoList, ToolError> {
        let _guard = self.guard();
        self.read()
    }

    pub fn replace(&self, list: TodoList) -> Result<(), ToolError> {
        let _guard = self.guard();
        self.write(&list)
    }

    /// Mark one item; returns false when no item has that name.
    pub fn set_completed(&self, name: &str, completed: bool) -> Result<bool, ToolError> {
        let _guard = self.guard();
        let mut list = self.read()?;
        let Some(item) = list.items.iter_mut().find(|item| item.name == name) else {
            return Ok(false);
        };
        item.completed = completed;
        self.write(&list)?;
        Ok(true)
    }

    pub fn clear(&self) -> Result<(), ToolError> {
        let _guard = self.guard();
        if self.path.exists() {
            fs::remove_file(&self.path)
                .map_err(|e| ToolError::execution_failed(format!("Failed to clear todos: {e}")))?;
        }
        Ok(())
    }
}

fn render(list: &TodoList) -> Result<ToolResult, ToolError> {
    ToolResult::json(&json!({
        "initialUserPrompt": list.initial_user_prompt,
        "items": list.items,
        "completion": format!("{}%", list.completion_percentage()),
    }))
    .map_err(|e| ToolError::execution_failed(e.to_string()))
}

// === Tools ===

pub struct SetItemsTool {
    store: SharedTodoStore,
}

impl SetItemsTool {
    pub fn new(store: SharedTodoStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ToolSpec for SetItemsTool {
    fn name(&self) -> &'static str {
        "set_items"
    }

    fn description(&self) -> &'static str {
        "Replace the task's todo list. Use at the start of multi-step work."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "items": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "name": {"type": "string"},
                            "completed": {"type": "boolean"}
                        },
                        "required": ["name"]
                    }
                },
                "initial_user_prompt": {
                    "type": "string",
                    "description": "The user request the list was made for"
                }
            },
            "required": ["items"]
        })
    }

    async fn execute(&self, input: Value, _context: &ToolContext) -> Result<ToolResult, ToolError> {
        let items: Vec<TodoItem> = serde_json::from_value(
            input.get("items").cloned().ok_or_else(|| ToolError::missing_field("items"))?,
        )
        .map_err(|e| ToolError::invalid_input(format!("Invalid items: {e}")))?;
        let list = TodoList {
            initial_user_prompt: optional_str(&input, "initial_user_prompt")
                .unwrap_or_default()
                .to_string(),
            items,
        };
        self.store.replace(list.clone())?;
        Ok(ToolResult::success(format!("Todo list set with {} item(s)", list.items.len())))
    }
}

pub struct GetItemsTool {
    store: SharedTodoStore,
}

impl GetItemsTool {
    pub fn new(store: SharedTodoStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ToolSpec for GetItemsTool {
    fn name(&self) -> &'static str {
        "get_items"
    }

    fn description(&self) -> &'static str {
        "Return the current todo list."
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _input: Value, _context: &ToolContext) -> Result<ToolResult, ToolError> {
        let list = self.store.load()?;
        if list.items.is_empty() {
            return Ok(ToolResult::success("No todo items."));
        }
        render(&list)
    }
}

pub struct UpdateItemCompletionTool {
    store: SharedTodoStore,
}

impl UpdateItemCompletionTool {
    pub fn new(store: SharedTodoStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ToolSpec for UpdateItemCompletionTool {
    fn name(&self) -> &'static str {
        "update_item_completion"
    }

    fn description(&self) -> &'static str {
        "Mark a todo item as completed or not completed."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "description": "Item name exactly as listed"},
                "completed": {"type": "boolean"}
            },
            "required": ["name", "completed"]
        })
    }

    async fn execute(&self, input: Value, _context: &ToolContext) -> Result<ToolResult, ToolError> {
        let name = required_str(&input, "name")?;
        let completed = optional_bool(&input, "completed", true);
        if self.store.set_completed(name, completed)? {
            Ok(ToolResult::success(format!(
                "Item '{name}' marked {}",
                if completed { "completed" } else { "not completed" }
            )))
        } else {
            Ok(ToolResult::error(format!("No todo item named '{name}'")))
        }
    }
}

pub struct ClearItemsTool {
    store: SharedTodoStore,
}

impl ClearItemsTool {
    pub fn new(store: SharedTodoStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ToolSpec for ClearItemsTool {
    fn name(&self) -> &'static str {
        "clear_items"
    }

    fn description(&self) -> &'static str {
        "Remove every todo item."
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _input: Value, _context: &ToolContext) -> Result<ToolResult, ToolError> {
        self.store.clear()?;
        Ok(ToolResult::success("Todo list cleared."))
    }
}
