use std::{
    env, io,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};

pub const APP_NAME: &str = "worktally";

/// Resolves `$XDG_STATE_HOME/worktally` (or `$HOME/.local/state/worktally`) and creates it.
pub fn create_application_default_path() -> Result<PathBuf> {
    let mut path = env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .or_else(|_| env::var("HOME").map(|home| PathBuf::from(home).join(".local/state")))
        .context("Couldn't find neither XDG_STATE_HOME nor HOME")?;
    path.push(APP_NAME);

    match std::fs::create_dir_all(&path) {
        Ok(_) => Ok(path),
        Err(v) if v.kind() == io::ErrorKind::AlreadyExists => Ok(path),
        Err(v) => Err(v.into()),
    }
}

/// Layout of the application directory shared by the daemon and the cli.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    root: PathBuf,
}

impl AppPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Uses `dir` when given, the default location otherwise.
    pub fn resolve(dir: Option<PathBuf>) -> Result<Self> {
        let root = match dir {
            Some(dir) => {
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("Failed to create {dir:?}"))?;
                // The daemon changes its working directory once detached.
                dir.canonicalize()?
            }
            None => create_application_default_path()?,
        };
        Ok(Self::new(root))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn socket(&self) -> PathBuf {
        self.root.join("worktally.sock")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.root.join("daemon.pid")
    }

    pub fn store_dir(&self) -> PathBuf {
        self.root.join("store")
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join(crate::daemon::config::CONFIG_FILE)
    }

    pub fn logs(&self) -> PathBuf {
        self.root.join("logs")
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use tempfile::tempdir;

    use super::AppPaths;

    #[test]
    fn test_explicit_dir_is_created_and_used() -> Result<()> {
        let dir = tempdir()?;
        let root = dir.path().join("nested/state");
        let paths = AppPaths::resolve(Some(root.clone()))?;
        let root = root.canonicalize()?;

        assert!(root.is_dir());
        assert_eq!(paths.socket(), root.join("worktally.sock"));
        assert_eq!(paths.config_file(), root.join("config.toml"));
        assert!(paths.store_dir().starts_with(paths.root()));
        Ok(())
    }
}
