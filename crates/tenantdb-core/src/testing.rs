//! In-memory [`Toolchain`] and [`ContainerRuntime`] doubles.
//!
//! Available to this crate's tests and, behind the `test-util` feature, to
//! downstream crates. Both fakes record the operations they receive and can
//! be told to fail a given operation.

use crate::error::{CoreError, Result, ToolError};
use crate::runtime::{ContainerRuntime, LaunchSpec, RuntimeHandle};
use crate::toolchain::{FsUsage, Toolchain};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone)]
struct FakeImage {
    size_mb: u64,
    /// Filesystem size; `None` until formatted.
    fs_mb: Option<u64>,
    used_mb: u64,
    /// Directories created inside the filesystem, by path under the mount.
    entries: HashSet<PathBuf>,
}

#[derive(Debug, Default)]
struct FakeFs {
    images: HashMap<PathBuf, FakeImage>,
    dirs: HashSet<PathBuf>,
    /// Mount point -> image.
    mounts: HashMap<PathBuf, PathBuf>,
    calls: Vec<&'static str>,
    failing: HashSet<String>,
    usage_unsupported: bool,
}

impl FakeFs {
    fn enter(&mut self, op: &'static str) -> std::result::Result<(), ToolError> {
        self.calls.push(op);
        if self.failing.contains(op) {
            return Err(exit(op, "injected failure"));
        }
        Ok(())
    }

    fn image_mut(&mut self, image: &Path) -> std::result::Result<&mut FakeImage, ToolError> {
        self.images
            .get_mut(image)
            .ok_or_else(|| exit("image", &format!("{}: no such file", image.display())))
    }

    fn is_image_mounted(&self, image: &Path) -> bool {
        self.mounts.values().any(|i| i == image)
    }

    /// Mount point and image holding `path`, if it lies inside a mount.
    fn containing_mount(&self, path: &Path) -> Option<(PathBuf, PathBuf)> {
        self.mounts
            .iter()
            .find(|(mount, _)| path != mount.as_path() && path.starts_with(mount))
            .map(|(m, i)| (m.clone(), i.clone()))
    }
}

/// True when `password` holds every character of `seed`, counting repeats.
pub fn contains_seed(password: &str, seed: &str) -> bool {
    let mut have: HashMap<char, usize> = HashMap::new();
    for c in password.chars() {
        *have.entry(c).or_default() += 1;
    }
    seed.chars().all(|c| match have.get_mut(&c) {
        Some(n) if *n > 0 => {
            *n -= 1;
            true
        }
        _ => false,
    })
}

fn exit(program: &str, stderr: &str) -> ToolError {
    ToolError::Exit {
        program: program.to_string(),
        code: 1,
        stderr: stderr.to_string(),
    }
}

/// Simulated loopback images, mounts and directories.
///
/// Enforces the ordering constraints of the real tools: resizing and
/// checking need an unmounted image, a filesystem must never be larger than
/// its image, and a shrink below the used space fails. `exists` is a query
/// and is not recorded in [`FakeToolchain::calls`].
#[derive(Debug, Default)]
pub struct FakeToolchain {
    state: Mutex<FakeFs>,
}

impl FakeToolchain {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeFs> {
        self.state.lock().expect("fake toolchain lock poisoned")
    }

    /// Make every call to `op` fail until [`clear_failures`](Self::clear_failures).
    ///
    /// Operation names: `allocate`, `extend`, `format`, `make_dir`,
    /// `remove_dir`, `remove_file`, `mount`, `unmount`, `check`, `resize`,
    /// `truncate`, `usage`.
    pub fn fail_on(&self, op: &str) {
        self.state().failing.insert(op.to_string());
    }

    pub fn clear_failures(&self) {
        self.state().failing.clear();
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Set the space in use on the filesystem mounted at `mount_path`.
    pub fn set_used(&self, mount_path: &Path, used_mb: u64) {
        let mut state = self.state();
        if let Some(image) = state.mounts.get(mount_path).cloned() {
            if let Some(img) = state.images.get_mut(&image) {
                img.used_mb = used_mb;
            }
        }
    }

    /// Make `usage` return `Ok(None)`.
    pub fn set_usage_unsupported(&self, unsupported: bool) {
        self.state().usage_unsupported = unsupported;
    }

    pub fn is_mounted(&self, mount_path: &Path) -> bool {
        self.state().mounts.contains_key(mount_path)
    }

    pub fn image_size(&self, image: &Path) -> Option<u64> {
        self.state().images.get(image).map(|i| i.size_mb)
    }

    pub fn image_count(&self) -> usize {
        self.state().images.len()
    }

    pub fn mount_count(&self) -> usize {
        self.state().mounts.len()
    }
}

#[async_trait]
impl Toolchain for FakeToolchain {
    async fn allocate(&self, image: &Path, size_mb: u64) -> std::result::Result<(), ToolError> {
        let mut state = self.state();
        state.enter("allocate")?;
        if state.images.contains_key(image) {
            return Err(exit("allocate", "file exists"));
        }
        state.images.insert(
            image.to_path_buf(),
            FakeImage {
                size_mb,
                fs_mb: None,
                used_mb: 0,
                entries: HashSet::new(),
            },
        );
        Ok(())
    }

    async fn extend(&self, image: &Path, new_size_mb: u64) -> std::result::Result<(), ToolError> {
        let mut state = self.state();
        state.enter("extend")?;
        let img = state.image_mut(image)?;
        // fallocate never shrinks a file
        img.size_mb = img.size_mb.max(new_size_mb);
        Ok(())
    }

    async fn format(&self, image: &Path) -> std::result::Result<(), ToolError> {
        let mut state = self.state();
        state.enter("format")?;
        let img = state.image_mut(image)?;
        img.fs_mb = Some(img.size_mb);
        img.used_mb = 0;
        img.entries.clear();
        Ok(())
    }

    async fn make_dir(&self, path: &Path) -> std::result::Result<(), ToolError> {
        let mut state = self.state();
        state.enter("make_dir")?;
        match state.containing_mount(path) {
            Some((mount, image)) => {
                let rel = path.strip_prefix(&mount).unwrap_or(path).to_path_buf();
                state.image_mut(&image)?.entries.insert(rel);
            }
            None => {
                state.dirs.insert(path.to_path_buf());
            }
        }
        Ok(())
    }

    async fn remove_dir(&self, path: &Path) -> std::result::Result<(), ToolError> {
        let mut state = self.state();
        state.enter("remove_dir")?;
        if let Some((mount, image)) = state.containing_mount(path) {
            let rel = path.strip_prefix(&mount).unwrap_or(path).to_path_buf();
            let img = state.image_mut(&image)?;
            if !img.entries.remove(&rel) {
                return Err(exit("remove_dir", "no such directory"));
            }
            img.entries.retain(|e| !e.starts_with(&rel));
            return Ok(());
        }
        if state.mounts.contains_key(path) {
            return Err(exit("remove_dir", "device or resource busy"));
        }
        if !state.dirs.remove(path) {
            return Err(exit("remove_dir", "no such directory"));
        }
        Ok(())
    }

    async fn remove_file(&self, path: &Path) -> std::result::Result<(), ToolError> {
        let mut state = self.state();
        state.enter("remove_file")?;
        if state.is_image_mounted(path) {
            return Err(exit("remove_file", "image is mounted"));
        }
        if state.images.remove(path).is_none() {
            return Err(exit("remove_file", "no such file"));
        }
        Ok(())
    }

    async fn exists(&self, path: &Path) -> bool {
        let state = self.state();
        if state.images.contains_key(path) || state.dirs.contains(path) {
            return true;
        }
        match state.containing_mount(path) {
            Some((mount, image)) => state.images.get(&image).is_some_and(|img| {
                path.strip_prefix(&mount)
                    .is_ok_and(|rel| img.entries.contains(rel))
            }),
            None => false,
        }
    }

    async fn mount_loop(
        &self,
        image: &Path,
        mount_path: &Path,
    ) -> std::result::Result<(), ToolError> {
        let mut state = self.state();
        state.enter("mount")?;
        if !state.dirs.contains(mount_path) {
            return Err(exit("mount", "mount point does not exist"));
        }
        if state.mounts.contains_key(mount_path) || state.is_image_mounted(image) {
            return Err(exit("mount", "already mounted"));
        }
        let img = state.image_mut(image)?;
        match img.fs_mb {
            None => return Err(exit("mount", "wrong fs type")),
            Some(fs) if fs > img.size_mb => {
                return Err(exit("mount", "filesystem larger than device"))
            }
            Some(_) => {}
        }
        state
            .mounts
            .insert(mount_path.to_path_buf(), image.to_path_buf());
        Ok(())
    }

    async fn unmount(&self, mount_path: &Path) -> std::result::Result<(), ToolError> {
        let mut state = self.state();
        state.enter("unmount")?;
        if state.mounts.remove(mount_path).is_none() {
            return Err(exit("umount", "not mounted"));
        }
        Ok(())
    }

    async fn check(&self, image: &Path) -> std::result::Result<(), ToolError> {
        let mut state = self.state();
        state.enter("check")?;
        if state.is_image_mounted(image) {
            return Err(exit("e2fsck", "filesystem is mounted"));
        }
        let img = state.image_mut(image)?;
        match img.fs_mb {
            Some(fs) if fs <= img.size_mb => Ok(()),
            Some(_) => Err(exit("e2fsck", "filesystem size exceeds device")),
            None => Err(exit("e2fsck", "bad superblock")),
        }
    }

    async fn resize(
        &self,
        image: &Path,
        size_mb: Option<u64>,
    ) -> std::result::Result<(), ToolError> {
        let mut state = self.state();
        state.enter("resize")?;
        if state.is_image_mounted(image) {
            return Err(exit("resize2fs", "filesystem is mounted"));
        }
        let img = state.image_mut(image)?;
        if img.fs_mb.is_none() {
            return Err(exit("resize2fs", "bad superblock"));
        }
        let target = size_mb.unwrap_or(img.size_mb);
        if target > img.size_mb {
            return Err(exit("resize2fs", "new size larger than device"));
        }
        if target < img.used_mb {
            return Err(exit("resize2fs", "no space left for data"));
        }
        img.fs_mb = Some(target);
        Ok(())
    }

    async fn truncate(&self, image: &Path, size_mb: u64) -> std::result::Result<(), ToolError> {
        let mut state = self.state();
        state.enter("truncate")?;
        state.image_mut(image)?.size_mb = size_mb;
        Ok(())
    }

    async fn usage(&self, mount_path: &Path) -> std::result::Result<Option<FsUsage>, ToolError> {
        let mut state = self.state();
        state.enter("usage")?;
        if state.usage_unsupported {
            return Ok(None);
        }
        let image = state
            .mounts
            .get(mount_path)
            .cloned()
            .ok_or_else(|| ToolError::NotMounted {
                path: mount_path.display().to_string(),
            })?;
        let img = state.image_mut(&image)?;
        let total_mb = img.fs_mb.unwrap_or(0);
        let percent = if total_mb == 0 {
            0
        } else {
            img.used_mb * 100 / total_mb
        };
        Ok(Some(FsUsage {
            used_mb: img.used_mb,
            total_mb,
            percent: format!("{percent}%"),
            mounted_on: mount_path.display().to_string(),
        }))
    }
}

/// A workload known to [`FakeRuntime`].
#[derive(Debug, Clone)]
pub struct FakeWorkload {
    pub id: String,
    pub spec: LaunchSpec,
    pub running: bool,
}

#[derive(Debug, Default)]
struct FakeEngine {
    workloads: HashMap<String, FakeWorkload>,
    endpoints: HashMap<String, PathBuf>,
    calls: Vec<&'static str>,
    failing: HashSet<String>,
    next_id: u64,
}

impl FakeEngine {
    fn enter(&mut self, op: &'static str) -> Result<()> {
        self.calls.push(op);
        if self.failing.contains(op) {
            return Err(CoreError::Provisioning(format!("{op}: injected failure")));
        }
        Ok(())
    }

    fn workload_mut(&mut self, name: &str) -> Result<&mut FakeWorkload> {
        self.workloads
            .get_mut(name)
            .ok_or_else(|| CoreError::Provisioning(format!("no such container: {name}")))
    }
}

/// In-memory container runtime.
///
/// Rejects duplicate names and host ports already bound by another
/// workload, like the real engine does.
#[derive(Debug, Default)]
pub struct FakeRuntime {
    state: Mutex<FakeEngine>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeEngine> {
        self.state.lock().expect("fake runtime lock poisoned")
    }

    /// Make every call to `op` fail. Operation names match the
    /// [`ContainerRuntime`] method names.
    pub fn fail_on(&self, op: &str) {
        self.state().failing.insert(op.to_string());
    }

    pub fn clear_failures(&self) {
        self.state().failing.clear();
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.state().calls.clone()
    }

    pub fn workload(&self, name: &str) -> Option<FakeWorkload> {
        self.state().workloads.get(name).cloned()
    }

    pub fn workload_count(&self) -> usize {
        self.state().workloads.len()
    }

    pub fn endpoint(&self, name: &str) -> Option<PathBuf> {
        self.state().endpoints.get(name).cloned()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn run(&self, spec: &LaunchSpec) -> Result<RuntimeHandle> {
        let mut state = self.state();
        state.enter("run")?;
        if state.workloads.contains_key(&spec.name) {
            return Err(CoreError::Provisioning(format!(
                "container name {} already in use",
                spec.name
            )));
        }
        if state
            .workloads
            .values()
            .any(|w| w.running && w.spec.host_port == spec.host_port)
        {
            return Err(CoreError::Provisioning(format!(
                "port {} is already allocated",
                spec.host_port
            )));
        }
        state.next_id += 1;
        let id = format!("{:012x}", state.next_id);
        state.workloads.insert(
            spec.name.clone(),
            FakeWorkload {
                id: id.clone(),
                spec: spec.clone(),
                running: true,
            },
        );
        Ok(RuntimeHandle {
            id,
            name: spec.name.clone(),
        })
    }

    async fn start(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        state.enter("start")?;
        state.workload_mut(name)?.running = true;
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        state.enter("stop")?;
        state.workload_mut(name)?.running = false;
        Ok(())
    }

    async fn remove(&self, name: &str, force: bool) -> Result<()> {
        let mut state = self.state();
        state.enter("remove")?;
        if state.workload_mut(name)?.running && !force {
            return Err(CoreError::Provisioning(format!(
                "container {name} is running, stop it or force removal"
            )));
        }
        state.workloads.remove(name);
        Ok(())
    }

    async fn create_storage_endpoint(&self, name: &str, mount_path: &Path) -> Result<()> {
        let mut state = self.state();
        state.enter("create_storage_endpoint")?;
        state
            .endpoints
            .insert(name.to_string(), mount_path.to_path_buf());
        Ok(())
    }

    async fn remove_storage_endpoint(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        state.enter("remove_storage_endpoint")?;
        if state.endpoints.remove(name).is_none() {
            return Err(CoreError::Provisioning(format!("no such volume: {name}")));
        }
        Ok(())
    }
}
