use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Stable artifact identifier, assigned by the external corpus loader.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactId(String);

impl ArtifactId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ArtifactId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ArtifactId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// One analyzed source unit. Created once per corpus load, decorated with
/// tags by rules throughout the run, never deleted during a run. The engine
/// never re-reads source text; `path` is carried for diagnostics and for
/// rules that match on file names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    pub path: PathBuf,
}

impl Artifact {
    pub fn new(id: impl Into<ArtifactId>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_id_display() {
        let id = ArtifactId::new("src/Main.java");
        assert_eq!(id.to_string(), "src/Main.java");
        assert_eq!(id.as_str(), "src/Main.java");
    }

    #[test]
    fn test_artifact_construction() {
        let artifact = Artifact::new("f1", "legacy/Facade.java");
        assert_eq!(artifact.id, ArtifactId::from("f1"));
        assert_eq!(artifact.path, PathBuf::from("legacy/Facade.java"));
    }
}
