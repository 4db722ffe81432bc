//! Task state the agent reads from and the VCS tools mutate.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::Message;

/// A file attached to the task's context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextFile {
    pub path: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Read access to task state plus the few mutations tools are allowed.
#[async_trait]
pub trait TaskContext: Send + Sync {
    fn project_dir(&self) -> &Path;

    /// Working directory of the task; equals the project dir unless a worktree is used.
    fn task_dir(&self) -> &Path;

    async fn context_files(&self) -> Vec<ContextFile>;

    async fn repo_map(&self) -> Option<String>;

    /// Prior conversation, oldest first.
    async fn context_messages(&self) -> Vec<Message>;

    /// Returns false when the file was already present.
    async fn add_context_file(&self, path: &str, read_only: bool) -> bool;

    /// Returns false when the file was not in context.
    async fn drop_context_file(&self, path: &str) -> bool;

    /// Hand a prompt to the task's coding backend and return its answer.
    async fn run_prompt(&self, prompt: &str) -> Result<String>;

    /// Add a run's cost to the task total.
    fn add_cost(&self, cost: f64);
}

/// In-memory task state used by the CLI and tests.
#[derive(Debug, Default)]
pub struct LocalTaskContext {
    project_dir: PathBuf,
    task_dir: PathBuf,
    repo_map: Option<String>,
    files: Mutex<Vec<ContextFile>>,
    messages: Mutex<Vec<Message>>,
    total_cost: Mutex<f64>,
}

impl LocalTaskContext {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        let project_dir = project_dir.into();
        Self {
            task_dir: project_dir.clone(),
            project_dir,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_task_dir(mut self, task_dir: impl Into<PathBuf>) -> Self {
        self.task_dir = task_dir.into();
        self
    }

    #[must_use]
    pub fn with_repo_map(mut self, repo_map: impl Into<String>) -> Self {
        self.repo_map = Some(repo_map.into());
        self
    }

    /// Append messages produced by a finished run.
    pub fn extend_messages(&self, messages: impl IntoIterator<Item = Message>) {
        lock(&self.messages).extend(messages);
    }

    pub fn total_cost(&self) -> f64 {
        *lock(&self.total_cost)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[async_trait]
impl TaskContext for LocalTaskContext {
    fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    fn task_dir(&self) -> &Path {
        &self.task_dir
    }

    async fn context_files(&self) -> Vec<ContextFile> {
        lock(&self.files).clone()
    }

    async fn repo_map(&self) -> Option<String> {
        self.repo_map.clone()
    }

    async fn context_messages(&self) -> Vec<Message> {
        lock(&self.messages).clone()
    }

    async fn add_context_file(&self, path: &str, read_only: bool) -> bool {
        let mut files = lock(&self.files);
        if files.iter().any(|f| f.path == path) {
            return false;
        }
        files.push(ContextFile {
            path: path.to_string(),
            read_only,
        });
        true
    }

    async fn drop_context_file(&self, path: &str) -> bool {
        let mut files = lock(&self.files);
        let before = files.len();
        files.retain(|f| f.path != path);
        files.len() != before
    }

    async fn run_prompt(&self, _prompt: &str) -> Result<String> {
        anyhow::bail!("No coding backend is attached to this task")
    }

    fn add_cost(&self, cost: f64) {
        *lock(&self.total_cost) += cost;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_and_drop_context_files() {
        let ctx = LocalTaskContext::new("/p");
        assert!(ctx.add_context_file("src/main.rs", false).await);
        assert!(!ctx.add_context_file("src/main.rs", true).await);
        assert_eq!(ctx.context_files().await.len(), 1);
        assert!(ctx.drop_context_file("src/main.rs").await);
        assert!(!ctx.drop_context_file("src/main.rs").await);
    }

    #[test]
    fn test_task_dir_defaults_to_project() {
        let ctx = LocalTaskContext::new("/p");
        assert_eq!(ctx.task_dir(), Path::new("/p"));
        let ctx = ctx.with_task_dir("/p/wt");
        assert_eq!(ctx.task_dir(), Path::new("/p/wt"));

        ctx.add_cost(0.5);
        ctx.add_cost(0.25);
        assert!((ctx.total_cost() - 0.75).abs() < f64::EPSILON);
    }
}
