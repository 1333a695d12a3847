//! Build settings the runtime relies on.

const WORKSPACE: &str = include_str!("../../../Cargo.toml");
const PD_CORE: &str = include_str!("../Cargo.toml");
const PD_COMMON: &str = include_str!("../../pd-common/Cargo.toml");

/// Body of a `[section]` up to the next table header.
fn section<'a>(manifest: &'a str, header: &str) -> &'a str {
    let start = manifest
        .find(header)
        .unwrap_or_else(|| panic!("missing {}", header))
        + header.len();
    let rest = &manifest[start..];
    rest.find("\n[").map_or(rest, |end| &rest[..end])
}

#[test]
fn release_profile_keeps_unwinding() {
    // Discovery recovers from a panicking collector thread only if panics unwind.
    for header in ["[profile.release]\n", "[profile.release-small]\n"] {
        let body = section(WORKSPACE, header);
        assert!(!body.contains("panic"), "{} must not set panic", header.trim());
    }
}

#[test]
fn crates_inherit_workspace_package() {
    for (name, manifest) in [("pd-core", PD_CORE), ("pd-common", PD_COMMON)] {
        let package = section(manifest, "[package]\n");
        for key in ["version", "edition", "license", "rust-version"] {
            let inherited = format!("{}.workspace = true", key);
            assert!(package.contains(&inherited), "{} does not inherit {}", name, key);
        }
    }
}
