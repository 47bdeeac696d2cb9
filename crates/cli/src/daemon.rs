//! PID file and shutdown signal handling for `flintd start`.

use std::path::PathBuf;
#[cfg(not(test))]
use tokio::signal;
use tracing::info;
#[cfg(not(test))]
use tracing::warn;

/// PID file written while the gateway runs.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `~/.flint/flintd.pid`.
    pub fn default_path() -> PathBuf {
        crate::config::flint_home().join("flintd.pid")
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Writes the current process ID, creating parent directories.
    pub async fn write(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, std::process::id().to_string()).await?;
        info!("PID file written: {}", self.path.display());
        Ok(())
    }

    pub async fn remove(&self) {
        if self.path.exists() {
            let _ = tokio::fs::remove_file(&self.path).await;
            info!("PID file removed: {}", self.path.display());
        }
    }
}

/// Resolves on SIGINT, or SIGTERM on unix.
#[cfg(not(test))]
pub async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = signal::ctrl_c() => info!("Received SIGINT, shutting down"),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                }
                return;
            }
            Err(e) => warn!("SIGTERM handler unavailable, waiting for SIGINT only: {e}"),
        }
    }

    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl-C, shutting down"),
        Err(e) => warn!("Ctrl-C handler failed, shutting down: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::with_locked_env;

    #[test]
    fn default_path_lives_under_flint_home() {
        let path = with_locked_env(PidFile::default_path);
        let text = path.to_string_lossy();
        assert!(text.contains(".flint"));
        assert!(text.ends_with("flintd.pid"));
    }

    #[tokio::test]
    async fn write_and_remove_pid_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let pid_path = tmp.path().join("run/flintd.pid");
        let pid_file = PidFile::new(&pid_path);

        pid_file.write().await.expect("pid write");
        let written = tokio::fs::read_to_string(pid_file.path())
            .await
            .expect("read pid");
        assert_eq!(
            written.parse::<u32>().expect("numeric pid"),
            std::process::id()
        );

        pid_file.remove().await;
        assert!(!pid_path.exists());
        pid_file.remove().await;
    }
}
