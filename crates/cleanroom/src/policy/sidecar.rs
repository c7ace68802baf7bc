//! Sidecar digest manifest: real layer digests per container image.
//!
//! Produced by the image build. YAML or JSON, shaped as an ordered list:
//!
//! ```yaml
//! - image: mcr.microsoft.com/cleanroom/ccr-proxy:1.0.8
//!   layers:
//!     - 4f3c...
//!     - 9ab1...
//! ```

use std::path::Path;

use common::{CleanroomError, Result};
use serde::{Deserialize, Serialize};

/// Layer digests of one image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidecarEntry {
    /// Image reference.
    pub image: String,
    /// dm-verity layer digests, in layer order.
    pub layers: Vec<String>,
}

/// Parsed sidecar digest manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SidecarDigests(Vec<SidecarEntry>);

impl SidecarDigests {
    pub fn new(entries: Vec<SidecarEntry>) -> Self {
        Self(entries)
    }

    /// Read and parse the manifest at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| CleanroomError::io(path, e))?;
        Self::parse(&bytes).map_err(|e| match e {
            CleanroomError::InvalidDocument(m) => {
                CleanroomError::InvalidDocument(format!("{}: {m}", path.display()))
            }
            other => other,
        })
    }

    /// Parse a manifest document.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        serde_yaml::from_slice(bytes)
            .map_err(|e| CleanroomError::InvalidDocument(format!("sidecar digests: {e}")))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Images in manifest order.
    pub fn images(&self) -> Vec<String> {
        self.0.iter().map(|e| e.image.clone()).collect()
    }

    /// Layers recorded for `image`.
    pub fn layers_for(&self, image: &str) -> Option<&[String]> {
        self.0
            .iter()
            .find(|e| e.image == image)
            .map(|e| e.layers.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_yaml_and_json() {
        let yaml = b"- image: a:1\n  layers: [x, y]\n- image: b:2\n  layers: []\n";
        let s = SidecarDigests::parse(yaml).unwrap();
        assert_eq!(s.len(), 2);
        assert_eq!(s.images(), vec!["a:1".to_owned(), "b:2".to_owned()]);
        assert_eq!(s.layers_for("a:1").unwrap(), ["x".to_owned(), "y".to_owned()]);
        assert!(s.layers_for("c:3").is_none());

        let json = br#"[{"image": "a:1", "layers": ["x"]}]"#;
        assert_eq!(SidecarDigests::parse(json).unwrap().len(), 1);
    }

    #[test]
    fn load_reports_path() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"image: not-a-list\n").unwrap();
        let err = SidecarDigests::load(f.path()).unwrap_err();
        assert!(matches!(err, CleanroomError::InvalidDocument(m) if m.contains("sidecar")));

        let missing = SidecarDigests::load(Path::new("/nonexistent/sidecar.yaml")).unwrap_err();
        assert!(matches!(missing, CleanroomError::Io { .. }));
    }
}
