//! Target architecture resolution: a build spec may pin `arch`; otherwise the scheduler
//! translates its own host architecture into the canonical form backends register under.

/// Canonical architecture string for the host this scheduler runs on.
pub fn host_arch() -> String {
    canonicalize(std::env::consts::ARCH)
}

fn canonicalize(arch: &str) -> String {
    match arch {
        "x86_64" => "x86_64",
        "x86" => "x86",
        "aarch64" => "aarch64",
        "arm" => "armv7",
        other => other,
    }
    .to_string()
}

/// Resolves the arch a package should build under: the spec's override if set, else the
/// host's canonical arch.
pub fn resolve_arch(spec_arch: Option<&str>) -> String {
    spec_arch.map(str::to_string).unwrap_or_else(host_arch)
}
