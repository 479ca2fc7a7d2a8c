use std::path::{Path, PathBuf};

/// Maps source paths recorded in compiled modules to paths in the workspace.
///
/// Each session builds its own resolver from its configuration; resolvers are
/// never shared between sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePathResolver {
    cwd: PathBuf,
    strip_source_prefix: Option<PathBuf>,
}

impl SourcePathResolver {
    pub fn new(cwd: impl Into<PathBuf>, strip_source_prefix: Option<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            strip_source_prefix,
        }
    }

    /// Resolves an artifact-embedded path. Always produces a path; whether the
    /// file exists is left to the editor.
    pub fn resolve(&self, artifact_path: impl AsRef<Path>) -> PathBuf {
        let artifact_path = artifact_path.as_ref();

        let remaining = self
            .strip_source_prefix
            .as_deref()
            .and_then(|prefix| artifact_path.strip_prefix(prefix).ok())
            .unwrap_or(artifact_path);

        if remaining.is_absolute() {
            remaining.to_path_buf()
        } else {
            self.cwd.join(remaining)
        }
    }
}
