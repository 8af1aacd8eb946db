//! Rewriting of the `dex2oat-cmdline` value recorded in OAT headers.
//!
//! When the compiler is started through the dynamic linker, the recorded command line starts with
//! the linker (or the `/proc/self/fd/<n>` path the linker was given) and ends with the flag the
//! launcher appended. Both are replaced here by what a direct invocation would have recorded.

use std::path::Path;

use crate::INJECTED_FLAG;

/// Returns whether the command line still carries the injected flag.
pub fn contains_injected_flag(cmdline: &[u8]) -> bool {
    cmdline
        .windows(INJECTED_FLAG.len())
        .any(|window| window == INJECTED_FLAG.as_bytes())
}

/// Sanitizes a recorded command line.
///
/// The invocation path is replaced by `original_path`, the injected flag is removed and the
/// remaining tokens are joined with single spaces. Returns `None` if the injected flag is absent,
/// i.e. there is nothing to hide.
pub fn sanitize(cmdline: &[u8], original_path: &str) -> Option<Vec<u8>> {
    if !contains_injected_flag(cmdline) {
        return None;
    }

    let mut tokens: Vec<&[u8]> = cmdline
        .split(|&b| b == b' ')
        .filter(|token| !token.is_empty())
        .collect();

    if let Some(&first) = tokens.first() {
        // `linker64 /proc/self/fd/<n> ...` is a single invocation path.
        if is_linker_path(first) && tokens.get(1).is_some_and(|second| is_proc_fd_path(second)) {
            tokens.remove(1);
        }
        if !original_path.is_empty() {
            tokens[0] = original_path.as_bytes();
        }
    }

    tokens.retain(|&token| token != INJECTED_FLAG.as_bytes());
    Some(tokens.join(&b' '))
}

fn is_linker_path(token: &[u8]) -> bool {
    let Ok(token) = std::str::from_utf8(token) else {
        return false;
    };
    Path::new(token)
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with("linker"))
}

/// Matches `/proc/<pid or self>/fd/<n>`.
fn is_proc_fd_path(token: &[u8]) -> bool {
    let Ok(token) = std::str::from_utf8(token) else {
        return false;
    };
    let mut parts = token.split('/');
    matches!(
        (parts.next(), parts.next(), parts.next(), parts.next(), parts.next(), parts.next()),
        (Some(""), Some("proc"), Some(_), Some("fd"), Some(fd), None)
            if !fd.is_empty() && fd.bytes().all(|b| b.is_ascii_digit())
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEX2OAT: &str = "/apex/com.android.art/bin/dex2oat64";

    #[test]
    fn linker_invocation_is_rewritten() {
        let cmdline = b"/apex/com.android.runtime/bin/linker64 /proc/self/fd/7 --foo --inline-max-code-units=0";
        let sanitized = sanitize(cmdline, DEX2OAT).unwrap();
        assert_eq!(sanitized, b"/apex/com.android.art/bin/dex2oat64 --foo");
    }

    #[test]
    fn fd_path_invocation_is_rewritten() {
        let cmdline = b"/proc/self/fd/9 --zip-fd=10 --inline-max-code-units=0 --compiler-filter=speed";
        let sanitized = sanitize(cmdline, DEX2OAT).unwrap();
        assert_eq!(
            sanitized,
            b"/apex/com.android.art/bin/dex2oat64 --zip-fd=10 --compiler-filter=speed"
        );
    }

    #[test]
    fn absent_flag_is_left_alone() {
        assert_eq!(sanitize(b"/apex/com.android.art/bin/dex2oat64 --foo", DEX2OAT), None);
    }

    #[test]
    fn sanitizing_twice_is_a_noop() {
        let once = sanitize(b"/proc/self/fd/3 --inline-max-code-units=0", DEX2OAT).unwrap();
        assert_eq!(sanitize(&once, DEX2OAT), None);
    }

    #[test]
    fn empty_original_path_keeps_first_token() {
        let sanitized = sanitize(b"/system/bin/dex2oat --inline-max-code-units=0 --foo", "").unwrap();
        assert_eq!(sanitized, b"/system/bin/dex2oat --foo");
    }

    #[test]
    fn non_fd_second_token_is_kept() {
        let sanitized =
            sanitize(b"/system/bin/linker /proc/self/exe --inline-max-code-units=0", DEX2OAT)
                .unwrap();
        assert_eq!(sanitized, b"/apex/com.android.art/bin/dex2oat64 /proc/self/exe");
    }
}
