use crate::config::Settings;
use crate::error::{MirrorError, Result};
use crate::traits::{Transfer, TransferOptions};
use crate::types::Protocol;
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::fs;
use tokio::process::Command;

/// Pulls a mirror tree with the external `rsync` binary.
pub struct RsyncTransfer {
    program: String,
    contimeout_secs: u64,
    timeout_secs: u64,
}

impl RsyncTransfer {
    pub fn new(program: &str, contimeout_secs: u64, timeout_secs: u64) -> Self {
        Self {
            program: program.to_string(),
            contimeout_secs,
            timeout_secs,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            &settings.rsync_program,
            settings.rsync_contimeout_secs,
            settings.rsync_timeout_secs,
        )
    }

    /// rsync arguments. Both sides get a trailing slash so the tree contents,
    /// not the directory itself, are copied.
    pub fn args(&self, source: &str, target: &Path, options: &TransferOptions) -> Vec<String> {
        let mut args = vec![
            "-rtlH".to_string(),
            "--safe-links".to_string(),
            "--delay-updates".to_string(),
            "--no-motd".to_string(),
            format!("--contimeout={}", self.contimeout_secs),
            format!("--timeout={}", self.timeout_secs),
        ];
        if options.prune_missing {
            args.push("--delete-after".to_string());
        }
        args.push(format!("{}/", source.trim_end_matches('/')));
        args.push(format!("{}/", target.to_string_lossy().trim_end_matches('/')));
        args
    }
}

#[async_trait]
impl Transfer for RsyncTransfer {
    fn protocol(&self) -> Protocol {
        Protocol::Rsync
    }

    async fn transfer(&self, source: &str, target: &Path, options: &TransferOptions) -> Result<()> {
        fs::create_dir_all(target).await?;

        let args = self.args(source, target, options);
        tracing::info!("Running {} {}", self.program, args.join(" "));

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| MirrorError::Transfer(format!("failed to execute {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MirrorError::Transfer(format!(
                "{} from {} exited with {}: {}",
                self.program,
                source,
                output.status,
                stderr.trim()
            )));
        }

        Ok(())
    }
}

/// Bounded retry around a single transfer attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: usize,
    pub min_delay: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            attempts: settings.transfer_attempts.max(1),
            min_delay: Duration::from_millis(settings.transfer_backoff_ms),
        }
    }

    pub fn into_backoff(self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.min_delay * 8)
            .with_max_times(self.attempts.saturating_sub(1))
    }
}

/// Run one transfer, retrying transfer failures per `policy`.
pub async fn transfer_with_retry<T>(
    transfer: &T,
    source: &str,
    target: &Path,
    options: &TransferOptions,
    policy: &RetryPolicy,
) -> Result<()>
where
    T: Transfer + ?Sized,
{
    let attempt = AtomicUsize::new(0);

    let op = || {
        attempt.fetch_add(1, Ordering::SeqCst);
        transfer.transfer(source, target, options)
    };

    op.retry(policy.clone().into_backoff())
        .when(|e| matches!(e, MirrorError::Transfer(_)))
        .notify(|err, dur| {
            tracing::warn!(
                "Transfer from {} failed (attempt {}), retrying in {:?}: {}",
                source,
                attempt.load(Ordering::SeqCst),
                dur,
                err
            );
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transfer for Flaky {
        fn protocol(&self) -> Protocol {
            Protocol::Rsync
        }

        async fn transfer(&self, source: &str, _target: &Path, _options: &TransferOptions) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(MirrorError::Transfer(format!("{} broke", source)))
            } else {
                Ok(())
            }
        }
    }

    fn quick(attempts: usize) -> RetryPolicy {
        RetryPolicy {
            attempts,
            min_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_args_prune_flag() {
        let rsync = RsyncTransfer::new("rsync", 10, 600);
        let target = Path::new("/srv/mirror");

        let keep = rsync.args("rsync://m/distro", target, &TransferOptions::default());
        assert!(!keep.contains(&"--delete-after".to_string()));
        assert_eq!(keep[keep.len() - 2], "rsync://m/distro/");
        assert_eq!(keep[keep.len() - 1], "/srv/mirror/");

        let prune = rsync.args(
            "rsync://m/distro/",
            target,
            &TransferOptions { prune_missing: true },
        );
        assert!(prune.contains(&"--delete-after".to_string()));
        assert!(prune.contains(&"--contimeout=10".to_string()));
        assert_eq!(prune[prune.len() - 2], "rsync://m/distro/");
    }

    #[tokio::test]
    async fn test_retry_recovers() {
        let flaky = Flaky {
            failures: 1,
            calls: AtomicUsize::new(0),
        };

        transfer_with_retry(&flaky, "rsync://m/", Path::new("/tmp/x"), &TransferOptions::default(), &quick(2))
            .await
            .unwrap();

        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_is_bounded() {
        let flaky = Flaky {
            failures: 10,
            calls: AtomicUsize::new(0),
        };

        let err = transfer_with_retry(&flaky, "rsync://m/", Path::new("/tmp/x"), &TransferOptions::default(), &quick(3))
            .await
            .unwrap_err();

        assert!(matches!(err, MirrorError::Transfer(_)));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_status_maps_to_transfer_error() -> Result<()> {
        let dir = tempdir()?;

        RsyncTransfer::new("true", 1, 1)
            .transfer("rsync://m/distro", dir.path(), &TransferOptions::default())
            .await?;

        let err = RsyncTransfer::new("false", 1, 1)
            .transfer("rsync://m/distro", dir.path(), &TransferOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::Transfer(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_program_is_transfer_error() -> Result<()> {
        let dir = tempdir()?;

        let err = RsyncTransfer::new("/nonexistent/rsync-binary", 1, 1)
            .transfer("rsync://m/distro", dir.path(), &TransferOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::Transfer(_)));
        Ok(())
    }
}
