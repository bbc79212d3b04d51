//! Built-in functions, well-known types and the shell capability.

pub mod functions;
pub mod shell;
pub mod types;

use crate::error::TaskError;
use crate::payload::{Args, Payload};
use crate::registry::Registry;

pub use shell::{CommandOutput, CommandRunner, ShellCommand};

/// Populate `registry` with every built-in function and type.
pub fn register_all(registry: &mut Registry) {
    functions::register(registry);
    types::register(registry);
}

/// Positional args for `target`, checking the count lies in `min..=max`.
pub(crate) fn positional(
    target: &str,
    args: Args,
    min: usize,
    max: usize,
) -> Result<Vec<Payload>, TaskError> {
    let values = args.into_positional(target)?;
    if values.len() < min || values.len() > max {
        let expected = if min == max {
            format!("{min}")
        } else {
            format!("{min} to {max}")
        };
        return Err(TaskError::arguments(
            target,
            format!("expected {expected} arguments, got {}", values.len()),
        ));
    }
    Ok(values)
}

pub(crate) fn require_text<'a>(target: &str, value: &'a Payload) -> Result<&'a str, TaskError> {
    value.as_str().ok_or_else(|| {
        TaskError::arguments(target, format!("expected text, got {}", value.type_name()))
    })
}

pub(crate) fn require_int(target: &str, value: &Payload) -> Result<i64, TaskError> {
    value.as_i64().ok_or_else(|| {
        TaskError::arguments(target, format!("expected int, got {}", value.type_name()))
    })
}
