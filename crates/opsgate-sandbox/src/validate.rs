//! Argument validation.
//!
//! argv is never passed through a shell, but a tool may reinterpret an
//! argument itself (templating, `sh -c` wrappers), so every token after the
//! binary name is checked for shell metacharacters.

use opsgate_contracts::error::{OpsError, OpsResult};

/// Characters rejected anywhere in an argument.
pub const DENIED_CHARS: &[char] = &[
    ';', '|', '&', '$', '`', '!', '(', ')', '{', '}', '[', ']', '<', '>', '\\', '"', '\'', '\n',
    '\r',
];

/// Reject argv if any entry after the binary name is empty or carries a
/// denied character. `argv[0]` is never checked.
pub fn validate_argv(argv: &[String]) -> OpsResult<()> {
    for (index, argument) in argv.iter().enumerate().skip(1) {
        if argument.is_empty() {
            return Err(OpsError::EmptyArgument { index });
        }
        if argument.contains(DENIED_CHARS) {
            return Err(OpsError::DangerousArgument {
                index,
                argument: argument.clone(),
            });
        }
    }
    Ok(())
}
