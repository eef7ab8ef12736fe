//! POSIX shell quoting for remote command lines.

/// Quote `arg` as a single POSIX shell word.
///
/// Wraps in single quotes and rewrites embedded `'` as `'\''`.
pub fn quote(arg: &str) -> String {
    let mut out = String::with_capacity(arg.len() + 2);
    out.push('\'');
    for c in arg.chars() {
        if c == '\'' {
            out.push_str(r"'\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}
