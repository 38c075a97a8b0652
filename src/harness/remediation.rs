static REMEDIATIONS: &[(&str, &str)] = &[
    (
        "contains a virus",
        "Your antivirus flagged the worker binary. Add an exception for the install folder or restore the file from quarantine, then try again.",
    ),
    (
        "potentially unwanted software",
        "Your antivirus flagged the worker binary. Add an exception for the install folder or restore the file from quarantine, then try again.",
    ),
    (
        "no such file or directory",
        "The worker binary could not be found. Check the configured binary path or reinstall.",
    ),
    (
        "not found",
        "The worker binary or its launcher could not be found. Check the configured binary path and PATH.",
    ),
    (
        "permission denied",
        "The worker binary is not executable by the current user. Check its permissions.",
    ),
    (
        "access is denied",
        "The worker binary is not executable by the current user. Check its permissions.",
    ),
];

/// Returns a user-facing hint for failure text that matches a known cause.
pub fn remediation_hint(text: &str) -> Option<&'static str> {
    let lower = text.to_ascii_lowercase();
    REMEDIATIONS
        .iter()
        .find(|(pattern, _)| lower.contains(pattern))
        .map(|(_, hint)| *hint)
}

/// Appends the matching hint, if any, to an error message.
pub fn with_remediation(message: String, evidence: &[&str]) -> String {
    let hint = std::iter::once(message.as_str())
        .chain(evidence.iter().copied())
        .find_map(remediation_hint);
    match hint {
        Some(hint) => format!("{}\n{}", message, hint),
        None => message,
    }
}

#[cfg(test)]
mod tests {
    use super::{remediation_hint, with_remediation};

    #[test]
    fn detects_known_failure_patterns() {
        assert!(remediation_hint("Operation did not complete successfully because the file contains a virus").is_some());
        assert!(remediation_hint("No such file or directory (os error 2)").is_some());
        assert!(remediation_hint("Permission denied (os error 13)").is_some());
        assert!(remediation_hint("exit status 1").is_none());
    }

    #[test]
    fn hint_can_come_from_stderr_evidence() {
        let message = with_remediation("failed to execute command".to_string(), &["", "file contains a virus"]);
        assert!(message.starts_with("failed to execute command\n"));
        assert!(message.contains("antivirus"));

        let untouched = with_remediation("exit status 2".to_string(), &["boring"]);
        assert_eq!(untouched, "exit status 2");
    }
}
