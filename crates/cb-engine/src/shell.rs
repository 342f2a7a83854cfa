//! Shell helpers for building remote command lines

/// Quote a value for interpolation into a remote shell command.
///
/// Wraps the value in single quotes; embedded single quotes are closed,
/// double-quoted, and reopened (`'` becomes `'"'"'`).
pub fn shell_escape(value: &str) -> String {
    format!("'{}'", value.replace('\'', r#"'"'"'"#))
}
