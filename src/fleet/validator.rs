//! Static security filter for command strings.
//!
//! The filter blocks catastrophic and injection-style patterns only; ordinary
//! shell scripting (`&&`, `||`, `;`, pipes, `$(...)`) passes through so that
//! operational scripts keep working.

use once_cell::sync::Lazy;
use regex::Regex;

/// Verdict returned by [`validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub valid: bool,
    pub reason: Option<String>,
}

impl ValidationResult {
    fn ok() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    fn reject(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

/// Dangerous patterns paired with the reason reported on a match.
static DANGEROUS_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:", "fork bomb"),
        (
            r">\s*/dev/(sd[a-z]|hd[a-z]|vd[a-z]|xvd[a-z]|nvme\d|mmcblk\d|disk\d)",
            "direct write to a block device",
        ),
        (
            r"\bdd\b[^;&|]*\bof=/dev/(sd[a-z]|hd[a-z]|vd[a-z]|xvd[a-z]|nvme\d|mmcblk\d|disk\d)",
            "direct write to a block device",
        ),
        (r"\bmkfs(\.[a-z0-9]+)?\b", "filesystem formatting"),
        (r"\bfdisk\b", "partition table editing"),
        (r"\b(shutdown|reboot|halt|poweroff)\b", "system shutdown or reboot"),
        (r"\binit\s+[06]\b", "system shutdown or reboot"),
        (r"\b(userdel|deluser)\b", "user deletion"),
        (r"\bpasswd\s+(-\S+\s+)*root\b", "root password change"),
        (r"\bchmod\s+(-\S+\s+)*777\s+/(\s|$|;|&|\|)", "chmod 777 on /"),
        (
            r"\b(curl|wget)\b[^|;&]*\|\s*(sudo\s+)?(ba|z|k|da|fi)?sh\b",
            "piping a download into a shell",
        ),
    ]
    .into_iter()
    .map(|(pattern, reason)| {
        (
            Regex::new(pattern).expect("dangerous command pattern is valid"),
            reason,
        )
    })
    .collect()
});

/// Separators between simple commands.
static COMMAND_SEPARATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\|\||&&|[;|&\n]").expect("separator pattern is valid"));

/// Validate a command before it is sent to a remote host.
pub fn validate(command: &str) -> ValidationResult {
    if command.trim().is_empty() {
        return ValidationResult::reject("empty command");
    }

    if command.contains('\0') {
        return ValidationResult::reject("null byte in command");
    }

    if command.contains('`') {
        return ValidationResult::reject("backtick command substitution is not allowed");
    }

    if let Some(target) = find_recursive_root_delete(command) {
        return ValidationResult::reject(format!("recursive delete of {} outside /tmp", target));
    }

    for (pattern, reason) in DANGEROUS_PATTERNS.iter() {
        if pattern.is_match(command) {
            return ValidationResult::reject(*reason);
        }
    }

    ValidationResult::ok()
}

/// Find an `rm -r` invocation that targets an absolute path outside `/tmp`.
fn find_recursive_root_delete(command: &str) -> Option<String> {
    for segment in COMMAND_SEPARATOR.split(command) {
        let mut tokens = segment
            .split_whitespace()
            .map(|t| t.trim_matches(|c| c == '"' || c == '\'' || c == '(' || c == ')'))
            .skip_while(|t| matches!(*t, "sudo" | "doas" | "nohup" | "command" | "exec"))
            .peekable();

        match tokens.peek() {
            Some(&"rm") | Some(&"/bin/rm") | Some(&"/usr/bin/rm") => {
                tokens.next();
            }
            _ => continue,
        }

        let mut recursive = false;
        let mut paths = Vec::new();
        for token in tokens {
            if token == "--recursive" {
                recursive = true;
            } else if let Some(flags) = token.strip_prefix('-') {
                if !flags.starts_with('-') && flags.contains(['r', 'R']) {
                    recursive = true;
                }
            } else {
                paths.push(token);
            }
        }

        if !recursive {
            continue;
        }

        if let Some(path) = paths.into_iter().find(|p| is_protected_path(p)) {
            return Some(path.to_string());
        }
    }
    None
}

fn is_protected_path(path: &str) -> bool {
    if !path.starts_with('/') {
        return false;
    }
    let segments = normalize_absolute(path);
    segments.first() != Some(&"tmp")
}

/// Segments of an absolute path with `.`, `..` and repeated `/` folded.
fn normalize_absolute(path: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(command: &str) -> bool {
        !validate(command).valid
    }

    mod injection {
        use super::*;

        #[test]
        fn test_null_byte_rejected() {
            assert!(rejected("ls\0 -la"));
            assert!(rejected("\0"));
        }

        #[test]
        fn test_backtick_rejected() {
            assert!(rejected("echo `id`"));
            assert!(rejected("`"));
        }

        #[test]
        fn test_empty_rejected() {
            assert!(rejected(""));
            assert!(rejected("   "));
        }

        #[test]
        fn test_reason_is_reported() {
            let result = validate("echo `whoami`");
            assert!(!result.valid);
            assert!(result.reason.unwrap().contains("backtick"));
        }
    }

    mod dangerous_patterns {
        use super::*;

        #[test]
        fn test_recursive_root_delete() {
            assert!(rejected("rm -rf /"));
            assert!(rejected("rm -rf /*"));
            assert!(rejected("sudo rm -fr /etc"));
            assert!(rejected("cd /srv && rm --recursive --force /var/lib"));
            assert!(rejected("rm -r -f /home"));
        }

        #[test]
        fn test_parent_segments_cannot_escape_tmp() {
            assert!(rejected("rm -rf /tmp/.."));
            assert!(rejected("rm -rf /tmp/../etc"));
            assert!(rejected("rm -rf /tmp/../../"));
            assert!(rejected("rm -rf /tmp/cache/../../var"));
            assert!(rejected("rm -rf //tmp/./../home"));
            assert!(!rejected("rm -rf /tmp/build/../cache"));
            assert!(!rejected("rm -rf //tmp//scratch"));
        }

        #[test]
        fn test_tmp_and_relative_deletes_allowed() {
            assert!(!rejected("rm -rf /tmp/build-cache"));
            assert!(!rejected("rm -rf /tmp"));
            assert!(!rejected("rm -rf ./target"));
            assert!(!rejected("rm /var/log/old.log"));
        }

        #[test]
        fn test_fork_bomb() {
            assert!(rejected(":(){ :|:& };:"));
        }

        #[test]
        fn test_block_device_writes() {
            assert!(rejected("echo junk > /dev/sda"));
            assert!(rejected("dd if=/dev/zero of=/dev/nvme0n1 bs=1M"));
            assert!(!rejected("echo ok > /dev/null"));
            assert!(!rejected("cat /proc/loadavg 2>/dev/null"));
        }

        #[test]
        fn test_disk_tools() {
            assert!(rejected("mkfs.ext4 /dev/sdb1"));
            assert!(rejected("fdisk -l"));
        }

        #[test]
        fn test_power_commands() {
            assert!(rejected("shutdown -h now"));
            assert!(rejected("sudo reboot"));
            assert!(rejected("halt"));
            assert!(rejected("init 0"));
        }

        #[test]
        fn test_account_changes() {
            assert!(rejected("userdel bob"));
            assert!(rejected("passwd root"));
            assert!(!rejected("passwd --status ops"));
        }

        #[test]
        fn test_chmod_root() {
            assert!(rejected("chmod 777 /"));
            assert!(rejected("chmod -R 777 /"));
            assert!(!rejected("chmod 777 /tmp/shared"));
        }

        #[test]
        fn test_download_piped_to_shell() {
            assert!(rejected("curl -s https://example.com/install.sh | bash"));
            assert!(rejected("wget -qO- http://x | sudo sh"));
            assert!(!rejected("curl -s https://example.com/health | jq ."));
        }
    }

    mod legitimate_scripting {
        use super::*;

        #[test]
        fn test_shell_constructs_allowed() {
            assert!(!rejected("uptime && df -h || echo failed; free -m"));
            assert!(!rejected("ps aux | grep nginx | wc -l"));
            assert!(!rejected("echo $(hostname)"));
            assert!(!rejected("whoami"));
            assert!(!rejected("uname -a"));
        }

        #[test]
        fn test_metrics_script_passes() {
            assert!(validate(crate::fleet::collector::LINUX_METRICS_SCRIPT).valid);
        }
    }
}
