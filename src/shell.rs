use anyhow::{Context, Result};
use std::path::Path;
use std::process::{Command, Stdio};

use crate::platform::Os;

/// Native shell hook: tear down windows and native resources, then exit.
/// Idempotent and synchronous.
pub trait NativeShell: Send + Sync {
    fn terminate(&self);
}

/// Starts the freshly installed build as an independent process.
pub trait Relauncher: Send + Sync {
    fn relaunch(&self, path: &Path, args: &[String]) -> Result<()>;
}

/// Shell for headless hosts: plain process exit.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExit;

impl NativeShell for ProcessExit {
    fn terminate(&self) {
        tracing::info!("terminating for update");
        std::process::exit(0);
    }
}

/// Spawns the new build detached from this process so it outlives it.
#[derive(Debug, Clone, Copy)]
pub struct DetachedLauncher {
    os: Os,
}

impl DetachedLauncher {
    pub fn new(os: Os) -> Self {
        Self { os }
    }
}

impl Default for DetachedLauncher {
    fn default() -> Self {
        Self::new(Os::current())
    }
}

impl Relauncher for DetachedLauncher {
    fn relaunch(&self, path: &Path, args: &[String]) -> Result<()> {
        let mut cmd = match self.os {
            Os::Macos => {
                let mut c = Command::new("open");
                c.arg(path);
                if !args.is_empty() {
                    c.arg("--args").args(args);
                }
                c
            }
            Os::Win => {
                let mut c = Command::new("cmd");
                c.args(["/C", "start", ""]).arg(path).args(args);
                c
            }
            Os::Linux => {
                let mut c = Command::new(path);
                c.args(args);
                c
            }
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group: no SIGHUP when our terminal session goes away.
            cmd.process_group(0);
        }
        cmd.spawn()
            .with_context(|| format!("Failed to launch {}", path.display()))?;
        tracing::info!(path = %path.display(), "launched new build");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_linux_launch_runs_target() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("launched");
        let script = dir.path().join("app");
        std::fs::write(
            &script,
            format!("#!/bin/sh\necho \"$1\" > \"{}\"\n", marker.display()),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        DetachedLauncher::new(Os::Linux)
            .relaunch(&script, &["--updated".to_string()])
            .unwrap();

        // Detached: poll for the side effect instead of waiting on the child.
        for _ in 0..100 {
            if let Ok(s) = std::fs::read_to_string(&marker) {
                if !s.is_empty() {
                    assert_eq!(s.trim(), "--updated");
                    return;
                }
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        panic!("relaunched process never ran");
    }

    #[test]
    fn test_missing_target_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = DetachedLauncher::new(Os::Linux).relaunch(&dir.path().join("nope"), &[]);
        assert!(err.is_err());
    }
}
