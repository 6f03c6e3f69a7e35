//! Command safety gate for exec tools.
//!
//! A deny-list of destructive shell patterns is always applied; an optional
//! allow-list restricts which programs may run at all. Both checks happen
//! before dispatch, after confirmation.

use crate::error::{ErrorCode, ToolError};

/// Substring patterns that are never allowed, regardless of confirmation.
const DENY_PATTERNS: &[&str] = &[
    "rm -rf /",
    "rm -rf /*",
    "rm -rf ~",
    "sudo ",
    "chmod 777",
    "> /dev/sd",
    "dd if=",
    "mkfs.",
    ":(){:|:&};:",
    "curl | sh",
    "curl | bash",
    "wget | sh",
    "wget | bash",
];

/// Check one exec command. `allow_list` is a set of permitted program names;
/// empty means any program (the deny-list still applies).
pub fn check_command(command: &str, allow_list: &[String]) -> Result<(), ToolError> {
    let lowered = command.to_lowercase();
    if let Some(pattern) = DENY_PATTERNS.iter().find(|p| lowered.contains(&p.to_lowercase())) {
        tracing::warn!(command, pattern, "command blocked by deny-list");
        return Err(ToolError::new(
            ErrorCode::PolicyDenied,
            format!("command blocked by policy (matched '{}')", pattern),
        ));
    }

    if !allow_list.is_empty() {
        let program = first_program(command);
        match program {
            Some(program) if allow_list.iter().any(|a| a == &program) => {}
            Some(program) => {
                tracing::info!(command, program = %program, "program not on allow-list");
                return Err(ToolError::new(
                    ErrorCode::PolicyDenied,
                    format!("program '{}' is not on the allow-list", program),
                ));
            }
            None => {
                return Err(ToolError::new(
                    ErrorCode::PolicyDenied,
                    "could not parse command for allow-list check",
                ));
            }
        }
    }

    Ok(())
}

/// First token of the command, as the shell would see it.
fn first_program(command: &str) -> Option<String> {
    let tokens = shell_words::split(command).ok()?;
    tokens.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deny_list_blocks_destructive_commands() {
        assert!(check_command("rm -rf / --no-preserve-root", &[]).is_err());
        assert!(check_command("sudo apt install foo", &[]).is_err());
        assert!(check_command("echo hi | dd if=/dev/zero", &[]).is_err());
    }

    #[test]
    fn ordinary_commands_pass_without_allow_list() {
        assert!(check_command("cargo build --release", &[]).is_ok());
        assert!(check_command("ls -la src", &[]).is_ok());
    }

    #[test]
    fn allow_list_restricts_programs() {
        let allow = vec!["cargo".to_string(), "ls".to_string()];
        assert!(check_command("cargo test", &allow).is_ok());
        assert!(check_command("python -c 'print(1)'", &allow).is_err());
    }

    #[test]
    fn unparseable_command_is_denied_under_allow_list() {
        let allow = vec!["ls".to_string()];
        assert!(check_command("ls 'unterminated", &allow).is_err());
    }

    #[test]
    fn denied_errors_carry_policy_code() {
        let err = check_command("sudo reboot", &[]).unwrap_err();
        assert_eq!(err.code, ErrorCode::PolicyDenied);
    }
}
