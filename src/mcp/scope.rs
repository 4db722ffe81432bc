//! Scope resolution and placeholder interpolation for server configs.
//!
//! A scope is the sharing boundary of a connector: two requests for the same
//! server that resolve to the same scope share one live connection.

use super::config::{
    McpServerConfig, McpTransportConfig, PROJECT_DIR_PLACEHOLDER, TASK_DIR_PLACEHOLDER,
};

pub const GLOBAL_SCOPE: &str = "global";

/// Compute the scope a server config lives under.
///
/// A config that mentions only `${taskDir}` resolves like one with no
/// placeholders at all.
pub fn calculate_scope(
    config: &McpServerConfig,
    project_dir: Option<&str>,
    task_dir: Option<&str>,
) -> String {
    let fields = config.string_fields();
    let has_project = fields.iter().any(|s| s.contains(PROJECT_DIR_PLACEHOLDER));
    let has_task = fields.iter().any(|s| s.contains(TASK_DIR_PLACEHOLDER));

    match (has_project, has_task) {
        (true, true) => match project_dir {
            Some(project) => format!("{}:{}", project, task_dir.unwrap_or_default()),
            None => GLOBAL_SCOPE.to_string(),
        },
        (true, false) => project_dir.unwrap_or(GLOBAL_SCOPE).to_string(),
        (false, _) => task_dir
            .or(project_dir)
            .unwrap_or(GLOBAL_SCOPE)
            .to_string(),
    }
}

/// Return a copy of `config` with placeholders replaced in `args` and `env` values.
///
/// `command`, `url` and `headers` are left untouched.
pub fn interpolate(
    config: &McpServerConfig,
    project_dir: Option<&str>,
    task_dir: Option<&str>,
) -> McpServerConfig {
    let project = project_dir.unwrap_or(".");
    let task = task_dir.or(project_dir).unwrap_or(".");
    let substitute = |value: &str| {
        value
            .replace(PROJECT_DIR_PLACEHOLDER, project)
            .replace(TASK_DIR_PLACEHOLDER, task)
    };

    let mut interpolated = config.clone();
    if let McpTransportConfig::Local { args, env, .. } = &mut interpolated.transport {
        for arg in args.iter_mut() {
            *arg = substitute(arg);
        }
        for value in env.values_mut() {
            *value = substitute(value);
        }
    }
    interpolated
}

/// Key under which a connector is pooled.
pub fn pool_key(scope: &str, server_name: &str) -> String {
    format!("{scope}:{server_name}")
}
