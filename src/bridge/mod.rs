/*!
File bridge: filesystem operations inside a running data container, executed
by single-shot helper containers.

Every operation follows the same lifecycle: create a helper with the command
and required mounts, attach to the needed stream(s) *before* starting (early
output must not be lost), start bound to the data container's volumes, pump
bytes until end-of-stream, then remove the helper. An RAII guard force-removes
the helper on every exit path, so a failed start or pump can never leak a
container.

Helper names are unique per call and never reused; concurrent operations for
the same tenant therefore cannot collide even though this layer does not
serialize them.
*/

pub mod listing;

pub use listing::FileNode;

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::errors::{BridgeError, Result};
use crate::runtime::demux::{Demuxer, StreamKind};
use crate::runtime::{AttachOptions, AttachStream, ContainerRuntime, CreateSpec, StartOptions};
use crate::util::{shell_escape, unique_id};

/// Token the exists-helper prints when the probed path is present.
pub const EXISTS_TOKEN: &str = "file_found";

/// Uid that owns files written on behalf of a user.
pub const DEFAULT_FILE_OWNER: u32 = 1000;

#[derive(Debug, Clone)]
pub struct FileBridgeConfig {
    pub helper_image: String,
    /// Host directory staged into helper containers for large transfers.
    pub transfer_dir: PathBuf,
    /// Where the staging directory appears inside a helper.
    pub transfer_mount: String,
    /// Read stall deadline for quick helpers (mkdir, rm, exists, list).
    pub short_op_timeout: Duration,
    /// Read stall deadline while a transfer helper works silently
    /// (tar, untar, host-mount copies).
    pub transfer_timeout: Duration,
}

impl Default for FileBridgeConfig {
    fn default() -> Self {
        FileBridgeConfig {
            helper_image: "busybox:latest".into(),
            transfer_dir: PathBuf::from("/tmp/dockerbridge/transfer"),
            transfer_mount: "/transfer".into(),
            short_op_timeout: Duration::from_secs(60),
            transfer_timeout: Duration::from_secs(600),
        }
    }
}

/// Absolute in-container path for a caller-relative one, anchored at the
/// user-data mount.
pub fn absolute_userpath(user_data_dir: &str, path: &str) -> String {
    format!(
        "{}/{}",
        user_data_dir.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

pub struct FileBridge {
    runtime: Arc<dyn ContainerRuntime>,
    config: FileBridgeConfig,
}

/// Removes the helper container on drop unless it was already removed.
struct HelperGuard {
    runtime: Arc<dyn ContainerRuntime>,
    name: String,
    removed: bool,
}

impl HelperGuard {
    fn new(runtime: Arc<dyn ContainerRuntime>, name: String) -> Self {
        HelperGuard {
            runtime,
            name,
            removed: false,
        }
    }

    fn do_remove(&mut self) {
        if self.removed {
            return;
        }
        self.removed = true;
        if let Err(e) = self.runtime.remove_container(&self.name, true) {
            warn!(helper = %self.name, error = %e, "failed to remove helper container");
        }
    }

    fn remove_now(mut self) {
        self.do_remove();
    }
}

impl Drop for HelperGuard {
    fn drop(&mut self) {
        self.do_remove();
    }
}

impl FileBridge {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: FileBridgeConfig) -> Self {
        FileBridge { runtime, config }
    }

    pub fn config(&self) -> &FileBridgeConfig {
        &self.config
    }

    /// In-helper path of a file in the host staging directory.
    pub fn transfer_path(&self, file_name: &str) -> String {
        format!(
            "{}/{}",
            self.config.transfer_mount.trim_end_matches('/'),
            file_name
        )
    }

    fn staging_bind(&self) -> String {
        format!(
            "{}:{}",
            self.config.transfer_dir.display(),
            self.config.transfer_mount
        )
    }

    fn create_helper(&self, script: String, owner: Option<u32>) -> Result<HelperGuard> {
        let name = format!("bridge_{}", unique_id());
        debug!(helper = %name, script = %script, "creating helper container");
        self.runtime.create_container(&CreateSpec {
            image: self.config.helper_image.clone(),
            name: Some(name.clone()),
            command: Some(vec!["sh".into(), "-c".into(), script]),
            user: owner.map(|u| u.to_string()),
            stdin_open: true,
            ..Default::default()
        })?;
        Ok(HelperGuard::new(self.runtime.clone(), name))
    }

    fn start_helper(&self, name: &str, data_container: &str, with_staging: bool) -> Result<()> {
        let binds = if with_staging {
            vec![self.staging_bind()]
        } else {
            Vec::new()
        };
        self.runtime.start_container(
            name,
            &StartOptions {
                volumes_from: vec![data_container.to_string()],
                binds,
                ..Default::default()
            },
        )
    }

    /// Stream the file's bytes into `sink`. Returns the byte count.
    pub fn read_file(
        &self,
        data_container: &str,
        path: &str,
        sink: &mut dyn Write,
    ) -> Result<u64> {
        let script = format!("cat {}", shell_escape(path));
        self.pump_out(data_container, script, self.config.short_op_timeout, sink)
    }

    /// Write `source` to `path` inside the data container.
    pub fn write_file(
        &self,
        data_container: &str,
        path: &str,
        source: &mut dyn Read,
        owner: Option<u32>,
    ) -> Result<()> {
        let script = format!("cat > {}", shell_escape(path));
        self.pump_in(
            data_container,
            script,
            owner,
            self.config.short_op_timeout,
            source,
        )
    }

    pub fn mkdir(
        &self,
        data_container: &str,
        dir: &str,
        parents: bool,
        owner: Option<u32>,
    ) -> Result<()> {
        let script = format!(
            "mkdir {}{}",
            if parents { "-p " } else { "" },
            shell_escape(dir)
        );
        self.run_checked(data_container, script, owner, false)
    }

    pub fn remove(&self, data_container: &str, path: &str, recursive: bool) -> Result<()> {
        let script = format!(
            "rm {}{}",
            if recursive { "-r " } else { "" },
            shell_escape(path)
        );
        self.run_checked(data_container, script, None, false)
    }

    /// Stream a tar archive of `path` into `sink`.
    pub fn tar(&self, data_container: &str, path: &str, sink: &mut dyn Write) -> Result<u64> {
        let script = format!("tar -c -f - {}", shell_escape(path));
        self.pump_out(data_container, script, self.config.transfer_timeout, sink)
    }

    /// Extract the tar archive read from `source` into `target_dir`.
    pub fn untar(
        &self,
        data_container: &str,
        source: &mut dyn Read,
        target_dir: &str,
        owner: Option<u32>,
    ) -> Result<()> {
        let script = format!("tar -x -C {} -f -", shell_escape(target_dir));
        self.pump_in(
            data_container,
            script,
            owner,
            self.config.transfer_timeout,
            source,
        )
    }

    pub fn exists(&self, data_container: &str, path: &str) -> Result<bool> {
        let script = format!(
            "if [ -e {} ]; then echo {}; fi",
            shell_escape(path),
            EXISTS_TOKEN
        );
        let mut captured = Vec::new();
        self.pump_out(
            data_container,
            script,
            self.config.short_op_timeout,
            &mut captured,
        )?;
        Ok(String::from_utf8_lossy(&captured).contains(EXISTS_TOKEN))
    }

    /// Walk `dir` and return the parsed tree. With `recursive=false` the walk
    /// stops at depth one.
    pub fn list(&self, data_container: &str, dir: &str, recursive: bool) -> Result<FileNode> {
        let depth = if recursive { "" } else { "-maxdepth 1 " };
        let script = format!(
            "cd {} && find . {}| while read -r entry; do \
             if [ -d \"$entry\" ]; then printf 'd%s\\n' \"$entry\"; \
             else printf 'f%s\\n' \"$entry\"; fi; done",
            shell_escape(dir),
            depth
        );
        let mut captured = Vec::new();
        self.pump_out(
            data_container,
            script,
            self.config.short_op_timeout,
            &mut captured,
        )?;
        listing::parse_listing(&String::from_utf8_lossy(&captured))
    }

    /// Copy between the data volume and the host staging directory, which is
    /// additionally mounted into the helper.
    ///
    /// Copying onto an existing directory merges the source into it (a file
    /// source ends up nested inside — callers rely on that). Copying onto an
    /// existing non-directory target is refused up front.
    pub fn copy_with_host_mount(
        &self,
        data_container: &str,
        source: &str,
        target: &str,
        owner: Option<u32>,
    ) -> Result<()> {
        let src = shell_escape(source);
        let tgt = shell_escape(target);
        let script = format!(
            "if [ -e {tgt} ] && [ ! -d {tgt} ]; then \
             echo 'copy target exists and is not a directory' >&2; exit 1; fi; \
             cp -r {src} {tgt}"
        );
        self.run_checked(data_container, script, owner, true)
    }

    /// Create → attach stdout/stderr → start → pump stdout into `sink` →
    /// remove. The shared read path of every output-producing helper.
    fn pump_out(
        &self,
        data_container: &str,
        script: String,
        stall_deadline: Duration,
        sink: &mut dyn Write,
    ) -> Result<u64> {
        let guard = self.create_helper(script, None)?;
        let mut stream = self.runtime.attach_container(
            &guard.name,
            &AttachOptions {
                stdout: true,
                stderr: true,
                ..Default::default()
            },
        )?;
        stream.set_read_timeout(Some(stall_deadline))?;
        self.start_helper(&guard.name, data_container, false)?;
        let mut demux = Demuxer::new(stream);
        let outcome = demux.pump_to(sink, StreamKind::Stdout)?;
        if !outcome.stderr.is_empty() {
            debug!(
                helper = %guard.name,
                stderr = %String::from_utf8_lossy(&outcome.stderr),
                "helper wrote to stderr"
            );
        }
        guard.remove_now();
        Ok(outcome.forwarded)
    }

    /// Create → attach stdin → start → write `source` → half-close → drain
    /// until the helper exits → remove. The shared write path.
    fn pump_in(
        &self,
        data_container: &str,
        script: String,
        owner: Option<u32>,
        stall_deadline: Duration,
        source: &mut dyn Read,
    ) -> Result<()> {
        let guard = self.create_helper(script, owner)?;
        let mut stream = self.runtime.attach_container(
            &guard.name,
            &AttachOptions {
                stdin: true,
                ..Default::default()
            },
        )?;
        stream.set_read_timeout(Some(stall_deadline))?;
        self.start_helper(&guard.name, data_container, false)?;
        io::copy(source, &mut stream)?;
        stream.flush()?;
        stream.shutdown_write()?;
        // End-of-stream doubles as the bounded wait for helper exit.
        let mut demux = Demuxer::new(stream);
        while demux.next_frame()?.is_some() {}
        guard.remove_now();
        Ok(())
    }

    /// Run a command helper to completion and fail when it reported anything
    /// on stderr.
    fn run_checked(
        &self,
        data_container: &str,
        script: String,
        owner: Option<u32>,
        with_staging: bool,
    ) -> Result<()> {
        let deadline = if with_staging {
            self.config.transfer_timeout
        } else {
            self.config.short_op_timeout
        };
        let guard = self.create_helper(script, owner)?;
        let mut stream = self.runtime.attach_container(
            &guard.name,
            &AttachOptions {
                stdout: true,
                stderr: true,
                ..Default::default()
            },
        )?;
        stream.set_read_timeout(Some(deadline))?;
        self.start_helper(&guard.name, data_container, with_staging)?;
        let mut demux = Demuxer::new(stream);
        let stderr = demux.drain()?;
        guard.remove_now();
        if !stderr.is_empty() {
            return Err(BridgeError::runtime(format!(
                "helper command failed: {}",
                String::from_utf8_lossy(&stderr).trim()
            )));
        }
        Ok(())
    }
}
