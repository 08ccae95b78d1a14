use regex::Regex;
use std::sync::OnceLock;

struct CompiledPatterns {
    rm_flags: Regex,
    shutdown: Regex,
    reboot: Regex,
    curl_pipe: Regex,
    wget_pipe: Regex,
}

fn patterns() -> &'static CompiledPatterns {
    static PATTERNS: OnceLock<CompiledPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| CompiledPatterns {
        // Captures the flag tokens of an rm invocation bounded by shell
        // separators; the r+f check happens on the captured text so both
        // `-rf` and `-r ... -f` (either order, long options included) hit.
        rm_flags: Regex::new(r"(?i)(?:^|[\s;&|(`])rm\s+((?:--?[^\s;&|]+\s*)+)").unwrap(),
        shutdown: Regex::new(r"(?i)(?:^|[\s;&|(`])shutdown(?:\s|$|[;&|)])").unwrap(),
        reboot: Regex::new(r"(?i)(?:^|[\s;&|(`])reboot(?:\s|$|[;&|)])").unwrap(),
        curl_pipe: Regex::new(r"(?i)\bcurl\b[^|\n]*\|\s*(?:sudo\s+)?(?:ba|z|da)?sh\b").unwrap(),
        wget_pipe: Regex::new(r"(?i)\bwget\b[^|\n]*\|\s*(?:sudo\s+)?(?:ba|z|da)?sh\b").unwrap(),
    })
}

/// Returns the matched pattern label when the command contains a fragment
/// that may destroy state or execute remote code. Shared by the command
/// card executor and the code runner.
pub fn detect_dangerous(command: &str) -> Option<&'static str> {
    let compiled = patterns();

    for capture in compiled.rm_flags.captures_iter(command) {
        let flags = capture.get(1).map(|m| m.as_str()).unwrap_or_default();
        if rm_flags_force_recursive(flags) {
            return Some("rm -rf");
        }
    }
    if compiled.shutdown.is_match(command) {
        return Some("shutdown");
    }
    if compiled.reboot.is_match(command) {
        return Some("reboot");
    }
    if compiled.curl_pipe.is_match(command) {
        return Some("curl|sh");
    }
    if compiled.wget_pipe.is_match(command) {
        return Some("wget|sh");
    }
    None
}

fn rm_flags_force_recursive(flags: &str) -> bool {
    let mut recursive = false;
    let mut force = false;
    for token in flags.split_whitespace() {
        if let Some(long) = token.strip_prefix("--") {
            let long = long.to_ascii_lowercase();
            recursive |= long == "recursive";
            force |= long == "force";
        } else if let Some(short) = token.strip_prefix('-') {
            recursive |= short.contains('r') || short.contains('R');
            force |= short.contains('f') || short.contains('F');
        }
    }
    recursive && force
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_rm_rf_variants() {
        assert_eq!(detect_dangerous("rm -rf /tmp/x"), Some("rm -rf"));
        assert_eq!(detect_dangerous("rm -fr /tmp/x"), Some("rm -rf"));
        assert_eq!(detect_dangerous("rm -r -f build"), Some("rm -rf"));
        assert_eq!(detect_dangerous("RM -Rf build"), Some("rm -rf"));
        assert_eq!(
            detect_dangerous("echo ok && rm --recursive --force dist"),
            Some("rm -rf")
        );
    }

    #[test]
    fn plain_rm_is_not_flagged() {
        assert_eq!(detect_dangerous("rm notes.txt"), None);
        assert_eq!(detect_dangerous("rm -f single-file"), None);
        assert_eq!(detect_dangerous("rm -r just-recursive"), None);
    }

    #[test]
    fn rm_must_be_a_command_not_a_substring() {
        assert_eq!(detect_dangerous("echo alarm -rf"), None);
        assert_eq!(detect_dangerous("confirm -rf"), None);
    }

    #[test]
    fn detects_power_commands_behind_separators() {
        assert_eq!(detect_dangerous("shutdown -h now"), Some("shutdown"));
        assert_eq!(detect_dangerous("true; reboot"), Some("reboot"));
        assert_eq!(detect_dangerous("echo shutdown-sim"), None);
        assert_eq!(detect_dangerous("my_rebooter --dry-run"), None);
    }

    #[test]
    fn detects_piped_remote_execution() {
        assert_eq!(
            detect_dangerous("curl -sSL https://x.sh | bash"),
            Some("curl|sh")
        );
        assert_eq!(
            detect_dangerous("wget -qO- https://x.sh | sh"),
            Some("wget|sh")
        );
        assert_eq!(detect_dangerous("curl -o file.sh https://x.sh"), None);
        assert_eq!(detect_dangerous("wget https://x.tar.gz | tar xz"), None);
    }
}
