//! Resource file naming
//!
//! Every resource file is named `<name>.<kind>.<group>.<version>.yaml`. The
//! resource name may itself contain dots, so parsing splits from the right.
//! The core API group has no name on the wire; it is rendered and parsed as
//! the literal `core`.

/// Decoded pieces of a resource basename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileName {
    /// Object name, preserved verbatim.
    pub name: String,
    /// Lowercased kind token (singular, e.g. `pod`).
    pub kind: String,
    /// API group; empty string for the core group.
    pub group: String,
    /// API version (e.g. `v1`).
    pub version: String,
}

/// Parse a basename into its (name, kind, group, version) parts.
///
/// Requires at least five dot-separated segments and a final `yaml` segment.
/// Returns `None` for anything that does not look like a resource file.
pub fn parse(basename: &str) -> Option<FileName> {
    let parts: Vec<&str> = basename.split('.').collect();
    if parts.len() < 5 {
        return None;
    }
    if parts[parts.len() - 1] != "yaml" {
        return None;
    }
    let version = parts[parts.len() - 2].trim().to_lowercase();
    let mut group = parts[parts.len() - 3].trim().to_lowercase();
    let kind = parts[parts.len() - 4].trim().to_lowercase();
    let name = parts[..parts.len() - 4].join(".");
    if name.is_empty() || kind.is_empty() || version.is_empty() {
        return None;
    }
    if group == "core" {
        group = String::new();
    }
    Some(FileName {
        name,
        kind,
        group,
        version,
    })
}

/// Render the basename for an object. Inverse of [`parse`].
pub fn render(name: &str, kind: &str, group: &str, version: &str) -> String {
    let group = if group.is_empty() { "core" } else { group };
    format!(
        "{}.{}.{}.{}.yaml",
        name,
        kind.to_lowercase(),
        group.to_lowercase(),
        version.to_lowercase()
    )
}
