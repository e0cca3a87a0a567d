use std::fmt;
use std::path::PathBuf;

/// Operating systems a build can be published for. Renders as the token used
/// in artifact folder names (`stable-macos-arm64`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Os {
    Macos,
    Win,
    Linux,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Arm64,
    X64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    pub os: Os,
    pub arch: Arch,
}

impl Os {
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Os::Macos
        } else if cfg!(target_os = "windows") {
            Os::Win
        } else {
            Os::Linux
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Os::Macos => "macos",
            Os::Win => "win",
            Os::Linux => "linux",
        }
    }
}

impl Arch {
    pub fn current() -> Self {
        if cfg!(target_arch = "aarch64") {
            Arch::Arm64
        } else {
            Arch::X64
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Arch::Arm64 => "arm64",
            Arch::X64 => "x64",
        }
    }
}

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Platform {
    pub fn current() -> Self {
        Self {
            os: Os::current(),
            arch: Arch::current(),
        }
    }

    /// Folder holding every artifact for one channel/os/arch combination.
    pub fn folder(&self, channel: &str) -> String {
        format!("{}-{}-{}", channel, self.os, self.arch)
    }

    /// Name of the compressed full-build tarball on the host.
    /// macOS tarballs wrap a `.app` bundle and carry that suffix.
    pub fn tarball_file_name(&self, app_file_name: &str) -> String {
        match self.os {
            Os::Macos => format!("{app_file_name}.app.tar.zst"),
            _ => format!("{app_file_name}.tar.zst"),
        }
    }

    pub fn patch_tool_name(&self) -> &'static str {
        match self.os {
            Os::Win => "bspatch.exe",
            _ => "bspatch",
        }
    }
}

/// Strip spaces from an app name; every artifact name is built on this.
pub fn sanitize_app_name(name: &str) -> String {
    name.replace(' ', "")
}

/// Directory name of the app inside a Windows archive: spaces removed, dots
/// turned into dashes so the folder never looks like a file extension.
pub fn windows_bundle_dir_name(name: &str) -> String {
    sanitize_app_name(name).replace('.', "-")
}

/// Join a base URL and path segments without doubling slashes.
pub fn join_url(base: &str, segments: &[&str]) -> String {
    let mut url = base.trim_end_matches('/').to_string();
    for segment in segments {
        url.push('/');
        url.push_str(segment.trim_matches('/'));
    }
    url
}

/// OS-conventional per-user application data directory:
/// `~/Library/Application Support`, `%LOCALAPPDATA%`, or `$XDG_DATA_HOME`
/// (falling back to `~/.local/share`).
pub fn app_data_dir() -> Option<PathBuf> {
    dirs::data_local_dir()
}
