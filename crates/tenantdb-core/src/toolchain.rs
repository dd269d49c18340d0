//! Filesystem toolchain: image allocation, formatting, loop mounts, resize.
//!
//! [`HostToolchain`] drives the standard Linux utilities. Every call is a
//! blocking external process bounded by a timeout; a non-zero exit status is
//! reported as [`ToolError::Exit`] with the tool's stderr.

use crate::error::ToolError;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Maximum stderr kept in an error message.
const MAX_STDERR_LEN: usize = 4 * 1024;

/// Space figures for a mounted filesystem, in MB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsUsage {
    pub used_mb: u64,
    pub total_mb: u64,
    pub percent: String,
    /// Mount point of the filesystem that holds the queried path.
    pub mounted_on: String,
}

/// Operations on loopback image files and their mount points.
#[async_trait]
pub trait Toolchain: Send + Sync {
    /// Allocate a fixed-size image file of `size_mb`.
    async fn allocate(&self, image: &Path, size_mb: u64) -> Result<(), ToolError>;
    /// Grow an existing image file to `new_size_mb`.
    async fn extend(&self, image: &Path, new_size_mb: u64) -> Result<(), ToolError>;
    /// Format the image with a journaling filesystem.
    async fn format(&self, image: &Path) -> Result<(), ToolError>;
    async fn make_dir(&self, path: &Path) -> Result<(), ToolError>;
    /// Remove an empty directory.
    async fn remove_dir(&self, path: &Path) -> Result<(), ToolError>;
    async fn remove_file(&self, path: &Path) -> Result<(), ToolError>;
    async fn exists(&self, path: &Path) -> bool;
    async fn mount_loop(&self, image: &Path, mount_path: &Path) -> Result<(), ToolError>;
    async fn unmount(&self, mount_path: &Path) -> Result<(), ToolError>;
    /// Forced filesystem consistency check of an unmounted image.
    async fn check(&self, image: &Path) -> Result<(), ToolError>;
    /// Resize the filesystem to `size_mb`, or to fill the image when `None`.
    async fn resize(&self, image: &Path, size_mb: Option<u64>) -> Result<(), ToolError>;
    /// Truncate the image file to `size_mb`.
    async fn truncate(&self, image: &Path, size_mb: u64) -> Result<(), ToolError>;
    /// Space usage of the filesystem mounted at `mount_path`, or `None` when
    /// the query yields nothing usable. Fails with [`ToolError::NotMounted`]
    /// when nothing is mounted there.
    async fn usage(&self, mount_path: &Path) -> Result<Option<FsUsage>, ToolError>;
}

/// Toolchain backed by host utilities (`fallocate`, `mkfs.ext4`, `mount`,
/// `umount`, `e2fsck`, `resize2fs`, `truncate`, `df`).
#[derive(Debug, Clone)]
pub struct HostToolchain {
    timeout: Duration,
}

impl Default for HostToolchain {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl HostToolchain {
    /// Create a toolchain whose calls each time out after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run `program` with `args`, accepting exit codes in `ok_codes`.
    async fn run_accepting(
        &self,
        program: &str,
        args: &[&str],
        ok_codes: &[i32],
    ) -> Result<String, ToolError> {
        tracing::debug!(program, ?args, "Running tool");
        let start = std::time::Instant::now();

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(ToolError::Spawn {
                    program: program.to_string(),
                    source,
                })
            }
            Err(_) => {
                tracing::warn!(program, timeout = ?self.timeout, "Tool timed out");
                return Err(ToolError::Timeout {
                    program: program.to_string(),
                    timeout: self.timeout,
                });
            }
        };

        let code = output.status.code().unwrap_or(-1);
        tracing::debug!(
            program,
            code,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Tool finished"
        );

        if !ok_codes.contains(&code) {
            let mut stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.len() > MAX_STDERR_LEN {
                let mut end = MAX_STDERR_LEN;
                while !stderr.is_char_boundary(end) {
                    end -= 1;
                }
                stderr.truncate(end);
            }
            return Err(ToolError::Exit {
                program: program.to_string(),
                code,
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<String, ToolError> {
        self.run_accepting(program, args, &[0]).await
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn io_err(path: &Path, source: std::io::Error) -> ToolError {
    ToolError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[async_trait]
impl Toolchain for HostToolchain {
    async fn allocate(&self, image: &Path, size_mb: u64) -> Result<(), ToolError> {
        if let Some(parent) = image.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err(parent, e))?;
        }
        let size = format!("{size_mb}M");
        self.run("fallocate", &["-l", &size, &path_arg(image)])
            .await
            .map(drop)
    }

    async fn extend(&self, image: &Path, new_size_mb: u64) -> Result<(), ToolError> {
        let size = format!("{new_size_mb}M");
        self.run("fallocate", &["-l", &size, &path_arg(image)])
            .await
            .map(drop)
    }

    async fn format(&self, image: &Path) -> Result<(), ToolError> {
        self.run("mkfs.ext4", &["-F", "-q", &path_arg(image)])
            .await
            .map(drop)
    }

    async fn make_dir(&self, path: &Path) -> Result<(), ToolError> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| io_err(path, e))
    }

    async fn remove_dir(&self, path: &Path) -> Result<(), ToolError> {
        tokio::fs::remove_dir(path)
            .await
            .map_err(|e| io_err(path, e))
    }

    async fn remove_file(&self, path: &Path) -> Result<(), ToolError> {
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| io_err(path, e))
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn mount_loop(&self, image: &Path, mount_path: &Path) -> Result<(), ToolError> {
        self.run(
            "mount",
            &["-o", "loop", &path_arg(image), &path_arg(mount_path)],
        )
        .await
        .map(drop)
    }

    async fn unmount(&self, mount_path: &Path) -> Result<(), ToolError> {
        self.run("umount", &[&path_arg(mount_path)]).await.map(drop)
    }

    async fn check(&self, image: &Path) -> Result<(), ToolError> {
        // e2fsck exits 1 when it corrected errors, which still leaves a clean fs.
        self.run_accepting("e2fsck", &["-f", "-p", &path_arg(image)], &[0, 1])
            .await
            .map(drop)
    }

    async fn resize(&self, image: &Path, size_mb: Option<u64>) -> Result<(), ToolError> {
        let image = path_arg(image);
        match size_mb {
            Some(mb) => {
                let size = format!("{mb}M");
                self.run("resize2fs", &[&image, &size]).await.map(drop)
            }
            None => self.run("resize2fs", &[&image]).await.map(drop),
        }
    }

    async fn truncate(&self, image: &Path, size_mb: u64) -> Result<(), ToolError> {
        let size = format!("{size_mb}M");
        self.run("truncate", &["-s", &size, &path_arg(image)])
            .await
            .map(drop)
    }

    async fn usage(&self, mount_path: &Path) -> Result<Option<FsUsage>, ToolError> {
        let stdout = self.run("df", &["-m", &path_arg(mount_path)]).await?;
        match parse_df_output(&stdout) {
            Some(fs) if Path::new(&fs.mounted_on) != mount_path => {
                // df reports the enclosing filesystem for a bare directory
                tracing::debug!(path = %mount_path.display(), mounted_on = %fs.mounted_on, "Path is not a mount point");
                Err(ToolError::NotMounted {
                    path: path_arg(mount_path),
                })
            }
            parsed => Ok(parsed),
        }
    }
}

/// Parse `df -m` output: the data row's total, used, percent and mount point
/// columns.
///
/// Long device names make `df` wrap the data row, so the fields after the
/// header are joined before splitting.
pub fn parse_df_output(stdout: &str) -> Option<FsUsage> {
    let mut lines = stdout.lines();
    lines.next()?;
    let fields: Vec<&str> = lines.flat_map(str::split_whitespace).collect();
    if fields.len() < 6 {
        return None;
    }
    let total_mb = fields[1].parse().ok()?;
    let used_mb = fields[2].parse().ok()?;
    let percent = fields[4].to_string();
    if !percent.ends_with('%') {
        return None;
    }
    Some(FsUsage {
        used_mb,
        total_mb,
        percent,
        mounted_on: fields[5..].join(" "),
    })
}
