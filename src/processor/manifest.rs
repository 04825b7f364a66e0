//! About/About.xml reading
//!
//! The manifest is treated as plain tagged text, not as XML: mods ship all
//! kinds of malformed files and only two fields are needed.

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Manifest location relative to a mod's root folder
pub const MANIFEST_DIR: &str = "About";
pub const MANIFEST_FILE: &str = "About.xml";

/// Fields read from a manifest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub name: Option<String>,
    pub supported_versions: Vec<String>,
}

pub fn manifest_path(mod_root: &Path) -> PathBuf {
    mod_root.join(MANIFEST_DIR).join(MANIFEST_FILE)
}

/// Parse manifest text.
///
/// Versions come from `<li>` entries inside `<supportedVersions>` when that
/// block exists, otherwise from every numeric `<li>` in the file. Order is
/// kept and duplicates dropped.
pub fn parse_manifest(content: &str) -> Manifest {
    static NAME_RE: OnceLock<Regex> = OnceLock::new();
    static VERSIONS_BLOCK_RE: OnceLock<Regex> = OnceLock::new();
    static LI_RE: OnceLock<Regex> = OnceLock::new();

    let name_re = NAME_RE.get_or_init(|| Regex::new(r"<name>([^<]+)</name>").expect("valid name regex"));
    let block_re = VERSIONS_BLOCK_RE.get_or_init(|| {
        Regex::new(r"(?is)<supportedVersions>(.*?)</supportedVersions>").expect("valid block regex")
    });
    let li_re = LI_RE.get_or_init(|| Regex::new(r"<li>\s*([\d.]+)\s*</li>").expect("valid li regex"));

    let name = name_re
        .captures(content)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|n| !n.is_empty());

    let scope = block_re
        .captures(content)
        .and_then(|caps| caps.get(1))
        .map_or(content, |m| m.as_str());

    let mut supported_versions: Vec<String> = Vec::new();
    for caps in li_re.captures_iter(scope) {
        if let Some(v) = caps.get(1).map(|m| m.as_str().to_string()) {
            if !supported_versions.contains(&v) {
                supported_versions.push(v);
            }
        }
    }

    Manifest {
        name,
        supported_versions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inline_version_list() {
        let m = parse_manifest("<li>1.5</li><li>1.6</li>");
        assert_eq!(m.supported_versions, vec!["1.5", "1.6"]);
        assert_eq!(m.name, None);
    }

    #[test]
    fn test_full_manifest() {
        let content = r#"<?xml version="1.0" encoding="utf-8"?>
<ModMetaData>
  <name> Harmony </name>
  <packageId>brrainz.harmony</packageId>
  <supportedVersions>
    <li>1.4</li>
    <li>1.5</li>
    <li>1.5</li>
  </supportedVersions>
  <loadBefore>
    <li>Ludeon.RimWorld</li>
  </loadBefore>
  <incompatibleWith>
    <li>2.0</li>
  </incompatibleWith>
</ModMetaData>"#;
        let m = parse_manifest(content);
        assert_eq!(m.name.as_deref(), Some("Harmony"));
        assert_eq!(m.supported_versions, vec!["1.4", "1.5"]);
    }

    #[test]
    fn test_garbage_is_empty() {
        assert_eq!(parse_manifest("not xml at all"), Manifest::default());
        assert_eq!(parse_manifest("<name></name>").name, None);
    }

    #[test]
    fn test_manifest_path() {
        assert_eq!(
            manifest_path(Path::new("/mods/123")),
            PathBuf::from("/mods/123/About/About.xml")
        );
    }
}
