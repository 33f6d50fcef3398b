//! Lightweight static checks on uploaded agent sources.
//!
//! Rejects obvious sandbox escapes before a build is ever dispatched:
//! imports of operating-system or subprocess facilities and dynamic-code
//! builtins. This is a cheap gate, not a sandbox; isolation is the build
//! job's and the executor's problem.

/// Byte patterns whose presence rejects an upload.
const FORBIDDEN_PATTERNS: &[&str] = &[
    "import os",
    "from os import",
    "from os.path",
    "import subprocess",
    "from subprocess",
    "os.system",
    "os.popen",
    "eval(",
    "exec(",
    "__import__",
    "compile(",
];

/// Whether the uploaded file name carries an accepted extension.
pub fn allowed_extension(file_name: &str) -> bool {
    let lower = file_name.to_ascii_lowercase();
    lower.ends_with(".py") || lower.ends_with(".zip")
}

/// Scan uploaded source bytes for forbidden constructs. Returns the first
/// offending pattern.
pub fn scan_source(contents: &[u8]) -> Result<(), String> {
    let text = String::from_utf8_lossy(contents);

    for pattern in FORBIDDEN_PATTERNS {
        if text.contains(pattern) {
            return Err(format!("forbidden construct: {pattern}"));
        }
    }

    Ok(())
}
