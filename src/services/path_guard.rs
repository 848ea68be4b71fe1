//! Path & content guard for uploaded files.
//!
//! Every path derived from user input passes through [`sanitize`] before it
//! is joined onto a directory. The other predicates decide whether a
//! sanitized path may be staged ([`is_safe`]) and whether it is forwarded
//! to the remote ([`should_sync_to_remote`]). All functions are pure.

use thiserror::Error;

use crate::models::session::ContentKind;

const MAX_PATH_BYTES: usize = 1024;
const WORKSPACE_PREFIX: &str = "workspace";

const RESERVED_DEVICE_NAMES: [&str; 22] = [
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

const BUILD_ARTIFACT_DIRS: [&str; 9] = [
    "__pycache__",
    ".venv",
    "venv",
    "node_modules",
    ".git",
    "dist",
    "build",
    ".idea",
    ".vscode",
];

const JUNK_FILES: [&str; 2] = [".DS_Store", "Thumbs.db"];

const EXECUTABLE_EXTENSIONS: [&str; 11] = [
    "exe", "bat", "cmd", "com", "msi", "scr", "dll", "ps1", "vbs", "jar", "app",
];

const SHELL_EXTENSIONS: [&str; 3] = ["sh", "bash", "zsh"];

const KEY_MATERIAL_MARKERS: [&str; 8] = [
    "id_rsa",
    "id_dsa",
    "id_ecdsa",
    "id_ed25519",
    ".pem",
    ".p12",
    ".pfx",
    ".key",
];

/// A path the guard refuses, with a human-readable reason.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid path `{path}`: {reason}")]
pub struct GuardError {
    pub path: String,
    pub reason: String,
}

impl GuardError {
    fn new(path: &str, reason: impl Into<String>) -> Self {
        // Keep the reported path printable even when it carried control bytes.
        let printable: String = path
            .chars()
            .map(|c| if c.is_control() { '?' } else { c })
            .take(200)
            .collect();
        Self {
            path: printable,
            reason: reason.into(),
        }
    }
}

/// Outcome of a content predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(String),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Decision::Allow => None,
            Decision::Deny(reason) => Some(reason),
        }
    }
}

/// Normalize `path` into a relative, forward-slashed path with no `.`/`..`
/// segments and no leading `workspace/`.
pub fn sanitize(path: &str) -> Result<String, GuardError> {
    if path.contains('\0') {
        return Err(GuardError::new(path, "contains a NUL byte"));
    }
    if path.len() > MAX_PATH_BYTES {
        return Err(GuardError::new(
            path,
            format!("longer than {} bytes", MAX_PATH_BYTES),
        ));
    }

    let normalized = path.replace('\\', "/");
    if normalized.starts_with('/') || has_drive_prefix(&normalized) {
        return Err(GuardError::new(path, "absolute paths are not allowed"));
    }

    let mut segments = Vec::new();
    for segment in normalized.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(GuardError::new(path, "parent directory segments are not allowed")),
            _ => {}
        }
        if segment.chars().any(|c| c.is_control()) {
            return Err(GuardError::new(path, "contains control characters"));
        }
        if is_reserved_device_name(segment) {
            return Err(GuardError::new(
                path,
                format!("`{}` is a reserved device name", segment),
            ));
        }
        segments.push(segment);
    }

    if segments.len() > 1 && segments[0] == WORKSPACE_PREFIX {
        segments.remove(0);
    }

    if segments.is_empty() || (segments.len() == 1 && segments[0] == WORKSPACE_PREFIX) {
        return Err(GuardError::new(path, "path is empty"));
    }

    Ok(segments.join("/"))
}

/// Reject executables and files that look like credentials.
///
/// Shell scripts are only allowed when the caller opts in.
pub fn is_safe(relative_path: &str, allow_shell_scripts: bool) -> Decision {
    let filename = file_name(relative_path).to_ascii_lowercase();

    if let Some(marker) = KEY_MATERIAL_MARKERS
        .iter()
        .find(|marker| filename.contains(*marker))
    {
        return Decision::Deny(format!("looks like key material (`{}`)", marker));
    }
    if filename == ".env" || filename.starts_with(".env.") {
        return Decision::Deny("environment files may hold credentials".into());
    }

    if let Some(ext) = extension(&filename) {
        if EXECUTABLE_EXTENSIONS.contains(&ext) {
            return Decision::Deny(format!("executable files (.{}) are not accepted", ext));
        }
        if SHELL_EXTENSIONS.contains(&ext) && !allow_shell_scripts {
            return Decision::Deny(format!("shell scripts (.{}) are not accepted", ext));
        }
    }

    Decision::Allow
}

/// Build artifacts and editor state stay local; everything else goes to the
/// remote.
pub fn should_sync_to_remote(relative_path: &str) -> Decision {
    let segments: Vec<&str> = relative_path.split('/').collect();
    let dirs = &segments[..segments.len().saturating_sub(1)];

    if let Some(dir) = dirs.iter().find(|seg| BUILD_ARTIFACT_DIRS.contains(*seg)) {
        return Decision::Deny(format!("build artifact directory `{}`", dir));
    }

    let filename = file_name(relative_path);
    if JUNK_FILES.contains(&filename) {
        return Decision::Deny(format!("system file `{}`", filename));
    }
    if matches!(extension(filename), Some("pyc") | Some("pyo")) {
        return Decision::Deny("compiled Python bytecode".into());
    }

    Decision::Allow
}

/// Map a filename to a coarse content kind by extension.
pub fn classify(filename: &str) -> ContentKind {
    let lower = file_name(filename).to_ascii_lowercase();
    let Some(ext) = extension(&lower) else {
        return ContentKind::Other;
    };
    match ext {
        "rs" | "py" | "js" | "mjs" | "ts" | "jsx" | "tsx" | "java" | "kt" | "c" | "h" | "cpp"
        | "hpp" | "cc" | "cs" | "go" | "rb" | "php" | "swift" | "scala" | "html" | "htm"
        | "css" | "scss" | "sql" | "sh" | "json" | "yaml" | "yml" | "toml" | "xml" | "vue"
        | "svelte" | "ipynb" => ContentKind::Source,
        "fig" | "sketch" | "xd" | "drawio" | "penpot" | "framer" => ContentKind::Prototype,
        "md" | "txt" | "pdf" | "doc" | "docx" | "rst" | "odt" | "rtf" | "csv" | "xls"
        | "xlsx" | "ppt" | "pptx" => ContentKind::Documentation,
        "png" | "jpg" | "jpeg" | "gif" | "svg" | "webp" | "bmp" | "ico" | "psd" | "ai"
        | "mp4" | "webm" | "mov" => ContentKind::Visual,
        "zip" | "tar" | "gz" | "tgz" | "bz2" | "xz" | "7z" | "rar" => ContentKind::Archive,
        _ => ContentKind::Other,
    }
}

/// Guess a MIME type from the file extension.
pub fn content_type(filename: &str) -> &'static str {
    let lower = file_name(filename).to_ascii_lowercase();
    match extension(&lower) {
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") | Some("mjs") => "application/javascript",
        Some("ts") | Some("tsx") => "application/typescript",
        Some("json") => "application/json",
        Some("md") => "text/markdown",
        Some("txt") | Some("rs") | Some("py") | Some("go") | Some("java") | Some("c")
        | Some("h") | Some("cpp") | Some("rb") | Some("toml") | Some("yaml") | Some("yml") => {
            "text/plain"
        }
        Some("csv") => "text/csv",
        Some("xml") => "application/xml",
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("webp") => "image/webp",
        Some("ico") => "image/x-icon",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("zip") => "application/zip",
        Some("gz") | Some("tgz") => "application/gzip",
        _ => "application/octet-stream",
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn extension(filename: &str) -> Option<&str> {
    filename
        .rsplit_once('.')
        .filter(|(stem, ext)| !stem.is_empty() && !ext.is_empty())
        .map(|(_, ext)| ext)
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn is_reserved_device_name(segment: &str) -> bool {
    let stem = segment.split('.').next().unwrap_or(segment).trim_end();
    RESERVED_DEVICE_NAMES
        .iter()
        .any(|name| name.eq_ignore_ascii_case(stem))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_normalizes_separators_and_strips_workspace_prefix() {
        assert_eq!(sanitize("src\\main.rs").unwrap(), "src/main.rs");
        assert_eq!(sanitize("workspace/src/./lib.rs").unwrap(), "src/lib.rs");
        assert_eq!(sanitize("docs//readme.md").unwrap(), "docs/readme.md");
        assert_eq!(sanitize("workspace.md").unwrap(), "workspace.md");
    }

    #[test]
    fn sanitize_rejects_traversal_and_absolute_paths() {
        assert!(sanitize("../etc/passwd").is_err());
        assert!(sanitize("a/../../b").is_err());
        assert!(sanitize("/etc/passwd").is_err());
        assert!(sanitize("\\\\server\\share").is_err());
        assert!(sanitize("C:\\Windows\\win.ini").is_err());
    }

    #[test]
    fn sanitize_rejects_nul_reserved_names_and_long_paths() {
        assert!(sanitize("a\0b").is_err());
        assert!(sanitize("docs/CON").is_err());
        assert!(sanitize("lpt1.txt").is_err());
        assert!(sanitize(&"a/".repeat(600)).is_err());
        assert!(sanitize("").is_err());
        assert!(sanitize("workspace/").is_err());
    }

    #[test]
    fn sanitize_reason_is_human_readable() {
        let err = sanitize("../secret").unwrap_err();
        assert_eq!(err.path, "../secret");
        assert!(err.to_string().contains("parent directory"));
    }

    #[test]
    fn sanitized_paths_never_escape() {
        for raw in ["a/b/c.txt", "workspace/x", "./y/z", "q\\r\\s.md"] {
            let clean = sanitize(raw).unwrap();
            assert!(!clean.starts_with('/'));
            assert!(!clean.split('/').any(|s| s == ".."));
        }
    }

    #[test]
    fn is_safe_blocks_executables_and_keys() {
        assert!(!is_safe("tools/setup.exe", false).is_allowed());
        assert!(!is_safe("run.BAT", false).is_allowed());
        assert!(!is_safe(".ssh/id_rsa", false).is_allowed());
        assert!(!is_safe("certs/server.pem", false).is_allowed());
        assert!(!is_safe(".env", false).is_allowed());
        assert!(is_safe("src/main.rs", false).is_allowed());
    }

    #[test]
    fn shell_scripts_need_opt_in() {
        assert!(!is_safe("scripts/deploy.sh", false).is_allowed());
        assert!(is_safe("scripts/deploy.sh", true).is_allowed());
    }

    #[test]
    fn build_artifacts_are_not_synced() {
        let decision = should_sync_to_remote("web/node_modules/react/index.js");
        assert_eq!(
            decision.reason(),
            Some("build artifact directory `node_modules`")
        );
        assert!(!should_sync_to_remote("__pycache__/mod.cpython-311.pyc").is_allowed());
        assert!(!should_sync_to_remote(".git/config").is_allowed());
        assert!(!should_sync_to_remote("app/.DS_Store").is_allowed());
        assert!(should_sync_to_remote("src/build.rs").is_allowed());
        assert!(should_sync_to_remote("docs/dist.md").is_allowed());
    }

    #[test]
    fn classify_by_extension() {
        assert_eq!(classify("src/app.py"), ContentKind::Source);
        assert_eq!(classify("design/home.fig"), ContentKind::Prototype);
        assert_eq!(classify("README.md"), ContentKind::Documentation);
        assert_eq!(classify("logo.PNG"), ContentKind::Visual);
        assert_eq!(classify("bundle.tar"), ContentKind::Archive);
        assert_eq!(classify("Makefile"), ContentKind::Other);
    }

    #[test]
    fn content_type_falls_back_to_octet_stream() {
        assert_eq!(content_type("index.html"), "text/html");
        assert_eq!(content_type("blob.bin"), "application/octet-stream");
    }
}
