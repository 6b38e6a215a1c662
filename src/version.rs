//! Build metadata embedded by build.rs

use std::fmt;

use crate::schema::fallback_schema;

/// Compile-time build details
#[derive(Debug, Clone)]
pub struct BuildInfo {
    pub name: &'static str,
    pub version: &'static str,
    /// Short commit hash, "unknown" outside a git checkout
    pub git_hash: &'static str,
    pub git_branch: &'static str,
    git_dirty: &'static str,
    pub build_timestamp: &'static str,
    pub target: &'static str,
    pub host: &'static str,
    /// debug / release
    pub profile: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub const fn current() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            git_hash: env!("EMBODIMENT_GIT_HASH"),
            git_branch: env!("EMBODIMENT_GIT_BRANCH"),
            git_dirty: env!("EMBODIMENT_GIT_DIRTY"),
            build_timestamp: env!("EMBODIMENT_BUILD_TIMESTAMP"),
            target: env!("EMBODIMENT_TARGET"),
            host: env!("EMBODIMENT_HOST"),
            profile: env!("EMBODIMENT_PROFILE"),
            rustc_version: env!("EMBODIMENT_RUSTC_VERSION"),
        }
    }

    pub fn git_dirty(&self) -> bool {
        self.git_dirty == "true"
    }

    /// Version with commit suffix, e.g. "0.1.0-1a2b3c4d"
    pub fn full_version(&self) -> String {
        let suffix = if self.git_dirty() { "-dirty" } else { "" };
        format!("{}-{}{}", self.version, self.git_hash, suffix)
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {}", self.name, self.full_version())?;
        writeln!(f)?;
        writeln!(f, "Build Information:")?;
        writeln!(f, "  Version:    {}", self.version)?;
        writeln!(
            f,
            "  Git Hash:   {}{}",
            self.git_hash,
            if self.git_dirty() { " (dirty)" } else { "" }
        )?;
        writeln!(f, "  Git Branch: {}", self.git_branch)?;
        writeln!(f, "  Built:      {}", self.build_timestamp)?;
        writeln!(f, "  Profile:    {}", self.profile)?;
        writeln!(f, "  Target:     {}", self.target)?;
        writeln!(f, "  Host:       {}", self.host)?;
        writeln!(f, "  Compiler:   {}", self.rustc_version)?;
        writeln!(f)?;
        writeln!(f, "Schema:")?;
        writeln!(f, "  Embedded:   {}", fallback_schema().version())?;
        Ok(())
    }
}

pub fn build_info() -> BuildInfo {
    BuildInfo::current()
}

/// Print version information to stdout
pub fn print_version() {
    print!("{}", build_info());
}

/// One-line identification for startup logs
pub fn banner() -> String {
    let info = build_info();
    format!("{} {} ({})", info.name, info.full_version(), info.profile)
}
