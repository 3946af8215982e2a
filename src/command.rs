//! Command-line assembly for toolchain actions.

use std::borrow::Cow;

use crate::config::{Project, RunOptions, ANY_ACTION};

/// Per-toolchain default arguments, keyed by action or `"*"`.
pub type DefaultArguments = &'static [(&'static str, &'static [&'static str])];

/// Builds the argument string for `action` on `project`.
///
/// The subcommand is `action` unless the project overrides it in `commands`. It is
/// followed by the project's arguments for `action` (or its `"*"` arguments when it has
/// none for `action`), the toolchain defaults for `action` and `"*"` (skipped for
/// overridden actions), and the trailing arguments of the invocation.
pub fn build_command(
    action: &str,
    project: &Project,
    defaults: &[(&str, &[&str])],
    options: &RunOptions,
) -> String {
    let overridden = project.commands.get(action);
    let mut parts: Vec<Cow<'_, str>> = vec![Cow::Borrowed(
        overridden.map(String::as_str).unwrap_or(action),
    )];

    let project_arguments = project
        .arguments
        .get(action)
        .or_else(|| project.arguments.get(ANY_ACTION));
    parts.extend(
        project_arguments
            .into_iter()
            .flatten()
            .map(|argument| Cow::Borrowed(argument.as_str())),
    );

    if overridden.is_none() {
        for key in [action, ANY_ACTION] {
            if let Some((_, arguments)) = defaults.iter().find(|(name, _)| *name == key) {
                parts.extend(arguments.iter().map(|argument| Cow::Borrowed(*argument)));
            }
        }
    }

    parts.extend(
        options
            .remaining_arguments
            .iter()
            .map(|argument| shell_words::quote(argument)),
    );

    parts
        .iter()
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Splits a built command into an argument vector using POSIX shell-word rules.
pub fn split_command(command: &str) -> Result<Vec<String>, shell_words::ParseError> {
    shell_words::split(command)
}
