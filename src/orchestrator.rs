/*!
Container orchestration: naming conventions, shared infrastructure bootstrap,
and per-user data/application container lifecycle.

Failure policy: every public operation wraps the runtime call, logs engine
failures with full detail, and hands the caller a neutral sentinel (`false`,
or `"error"` for string-returning calls). The front end never sees a raw
engine error.
*/

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::errors::Result;
use crate::runtime::demux::Demuxer;
use crate::runtime::{
    ContainerRuntime, ContainerSummary, CreateSpec, LogOptions, PortBinding, StartOptions,
};

/// Sentinel returned by string-valued operations when the runtime call fails.
pub const ERROR_SENTINEL: &str = "error";

pub const DATA_CONTAINER_PREFIX: &str = "data_";

/// Data-container name derived from a user container name. The file bridge
/// depends on this mapping; it is the only naming convention shared across
/// components.
pub fn data_container_name(user_container: &str) -> String {
    format!("{DATA_CONTAINER_PREFIX}{user_container}")
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Fixed absolute mount path of every user's data volume.
    pub user_data_dir: String,
    pub user_data_image: String,
    /// Read-only shared knowledge container, attached to every user container.
    pub knowledge_container: String,
    pub knowledge_image: String,
    pub mongo_data_container: String,
    pub mongo_data_image: String,
    pub mongo_data_volume: String,
    pub mongo_container: String,
    pub mongo_image: String,
    /// Internal port the user application listens on.
    pub application_port: u16,
    pub webapp_port: u16,
    pub webapp_command: Vec<String>,
    /// Base entries of the module search path handed to user containers.
    pub package_path: Vec<String>,
    pub stop_grace: Duration,
    pub max_log_bytes: usize,
    pub log_tail_lines: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            user_data_dir: "/home/ros/user_data".into(),
            user_data_image: "knowrob/user_data".into(),
            knowledge_container: "knowledge_data".into(),
            knowledge_image: "knowrob/knowrob_data".into(),
            mongo_data_container: "mongo_data".into(),
            mongo_data_image: "busybox".into(),
            mongo_data_volume: "/data/db".into(),
            mongo_container: "mongo_db".into(),
            mongo_image: "mongo".into(),
            application_port: 9090,
            webapp_port: 5000,
            webapp_command: vec!["python".into(), "runserver.py".into()],
            package_path: vec![
                "/home/ros/src".into(),
                "/opt/ros/hydro/share".into(),
                "/opt/ros/hydro/stacks".into(),
            ],
            stop_grace: Duration::from_secs(5),
            max_log_bytes: 2 * 1024 * 1024,
            log_tail_lines: 10_000,
        }
    }
}

pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: OrchestratorConfig) -> Self {
        Orchestrator { runtime, config }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    fn find<'a>(
        name: &str,
        all: &'a [ContainerSummary],
    ) -> Option<&'a ContainerSummary> {
        all.iter().find(|c| c.has_name(name))
    }

    /// Bring up the shared infrastructure containers if any are missing.
    /// Idempotent; safe to call before every lifecycle operation.
    pub fn ensure_common_infrastructure(&self) -> bool {
        let result = self
            .runtime
            .list_containers(true)
            .and_then(|all| self.ensure_common(&all));
        match result {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "ensure_common_infrastructure failed");
                false
            }
        }
    }

    fn ensure_common(&self, all: &[ContainerSummary]) -> Result<()> {
        let cfg = &self.config;
        if Self::find(&cfg.knowledge_container, all).is_none() {
            info!(container = %cfg.knowledge_container, "creating knowledge container");
            self.runtime.create_container(&CreateSpec {
                image: cfg.knowledge_image.clone(),
                name: Some(cfg.knowledge_container.clone()),
                entrypoint: Some(vec!["true".into()]),
                ..Default::default()
            })?;
            self.runtime
                .start_container(&cfg.knowledge_container, &StartOptions::default())?;
        }

        if Self::find(&cfg.mongo_data_container, all).is_none() {
            info!(container = %cfg.mongo_data_container, "creating mongo data container");
            // Data-only container: created, never started.
            self.runtime.create_container(&CreateSpec {
                image: cfg.mongo_data_image.clone(),
                name: Some(cfg.mongo_data_container.clone()),
                volumes: vec![cfg.mongo_data_volume.clone()],
                entrypoint: Some(vec!["true".into()]),
                ..Default::default()
            })?;
        }

        if Self::find(&cfg.mongo_container, all).is_none() {
            info!(container = %cfg.mongo_container, "creating mongo container");
            self.runtime.create_container(&CreateSpec {
                image: cfg.mongo_image.clone(),
                name: Some(cfg.mongo_container.clone()),
                ..Default::default()
            })?;
            self.runtime.start_container(
                &cfg.mongo_container,
                &StartOptions {
                    volumes_from: vec![cfg.mongo_data_container.clone()],
                    ..Default::default()
                },
            )?;
        }
        Ok(())
    }

    /// Create and start the user's data container unless it already exists.
    pub fn create_user_data_container(&self, user_container: &str) -> bool {
        match self.try_create_user_data_container(user_container) {
            Ok(()) => true,
            Err(e) => {
                error!(container = user_container, error = %e, "create_user_data_container failed");
                false
            }
        }
    }

    fn try_create_user_data_container(&self, user_container: &str) -> Result<()> {
        let all = self.runtime.list_containers(true)?;
        let data_name = data_container_name(user_container);
        if Self::find(&data_name, &all).is_some() {
            return Ok(());
        }
        info!(container = %data_name, "creating user data container");
        self.runtime.create_container(&CreateSpec {
            image: self.config.user_data_image.clone(),
            name: Some(data_name.clone()),
            volumes: vec![self.config.user_data_dir.clone()],
            entrypoint: Some(vec!["true".into()]),
            tty: true,
            ..Default::default()
        })?;
        self.runtime
            .start_container(&data_name, &StartOptions::default())
    }

    /// Start (or restart) the user's application container. A pre-existing
    /// container with the same name is stopped and removed first, so exactly
    /// one container with `name` exists afterwards.
    pub fn start_user_container(
        &self,
        name: &str,
        application_image: &str,
        links: &[String],
        volumes: &[String],
    ) -> bool {
        match self.try_start_user_container(name, application_image, links, volumes) {
            Ok(()) => true,
            Err(e) => {
                error!(container = name, error = %e, "start_user_container failed");
                false
            }
        }
    }

    fn try_start_user_container(
        &self,
        name: &str,
        application_image: &str,
        links: &[String],
        volumes: &[String],
    ) -> Result<()> {
        let all = self.runtime.list_containers(true)?;
        self.ensure_common(&all)?;
        self.stop_if_present(name, &all)?;

        let cfg = &self.config;
        let mut package_path = cfg.package_path.clone();
        package_path.push(cfg.user_data_dir.clone());

        info!(container = name, image = application_image, "creating user container");
        self.runtime.create_container(&CreateSpec {
            image: application_image.to_string(),
            name: Some(name.to_string()),
            env: vec![
                ("VIRTUAL_HOST".into(), name.to_string()),
                ("VIRTUAL_PORT".into(), cfg.application_port.to_string()),
                ("ROS_PACKAGE_PATH".into(), package_path.join(":")),
            ],
            tty: true,
            ..Default::default()
        })?;

        let mut volumes_from: Vec<String> = volumes.to_vec();
        volumes_from.push(data_container_name(name));
        volumes_from.push(cfg.knowledge_container.clone());

        info!(container = name, "starting user container");
        self.runtime.start_container(
            name,
            &StartOptions {
                port_bindings: vec![PortBinding {
                    container_port: cfg.application_port,
                    host_ip: "127.0.0.1".into(),
                    host_port: None,
                }],
                links: links.to_vec(),
                volumes_from,
                ..Default::default()
            },
        )
    }

    /// Create-if-absent start for the shared web application container.
    /// Unlike [`Orchestrator::start_user_container`] this never restarts an
    /// existing container.
    pub fn start_webapp_container(
        &self,
        name: &str,
        webapp_image: &str,
        links: &[String],
        volumes: &[String],
    ) -> bool {
        match self.try_start_webapp_container(name, webapp_image, links, volumes) {
            Ok(()) => true,
            Err(e) => {
                error!(container = name, error = %e, "start_webapp_container failed");
                false
            }
        }
    }

    fn try_start_webapp_container(
        &self,
        name: &str,
        webapp_image: &str,
        links: &[String],
        volumes: &[String],
    ) -> Result<()> {
        let all = self.runtime.list_containers(true)?;
        self.ensure_common(&all)?;
        if Self::find(name, &all).is_some() {
            return Ok(());
        }
        let cfg = &self.config;
        info!(container = name, image = webapp_image, "creating webapp container");
        self.runtime.create_container(&CreateSpec {
            image: webapp_image.to_string(),
            name: Some(name.to_string()),
            command: Some(cfg.webapp_command.clone()),
            env: vec![
                ("VIRTUAL_HOST".into(), name.to_string()),
                ("VIRTUAL_PORT".into(), cfg.webapp_port.to_string()),
                ("OPEN_EASE_WEBAPP".into(), "true".into()),
            ],
            tty: true,
            stdin_open: true,
            ..Default::default()
        })?;
        info!(container = name, "starting webapp container");
        self.runtime.start_container(
            name,
            &StartOptions {
                port_bindings: vec![PortBinding {
                    container_port: cfg.webapp_port,
                    host_ip: "127.0.0.1".into(),
                    host_port: None,
                }],
                links: links.to_vec(),
                volumes_from: volumes.to_vec(),
                ..Default::default()
            },
        )
    }

    /// Stop and remove the named container. No-op if it does not exist.
    pub fn stop_container(&self, name: &str) -> bool {
        let result = self
            .runtime
            .list_containers(true)
            .and_then(|all| self.stop_if_present(name, &all));
        match result {
            Ok(()) => true,
            Err(e) => {
                error!(container = name, error = %e, "stop_container failed");
                false
            }
        }
    }

    fn stop_if_present(&self, name: &str, all: &[ContainerSummary]) -> Result<()> {
        if Self::find(name, all).is_none() {
            return Ok(());
        }
        info!(container = name, "stopping container");
        self.runtime.stop_container(name, self.config.stop_grace)?;
        info!(container = name, "removing container");
        self.runtime.remove_container(name, false)
    }

    /// Internal network address of the container, or the `"error"` sentinel.
    pub fn get_container_ip(&self, name: &str) -> String {
        match self.runtime.inspect_container(name) {
            Ok(details) => details.ip_address,
            Err(e) => {
                warn!(container = name, error = %e, "get_container_ip failed");
                ERROR_SENTINEL.to_string()
            }
        }
    }

    /// Concatenated stdout+stderr log text in emission order, capped at
    /// `max_log_bytes` (a truncation marker is appended when the cap is hit),
    /// or the `"error"` sentinel.
    pub fn get_container_log(&self, name: &str) -> String {
        match self.try_get_container_log(name) {
            Ok(text) => text,
            Err(e) => {
                error!(container = name, error = %e, "get_container_log failed");
                ERROR_SENTINEL.to_string()
            }
        }
    }

    fn try_get_container_log(&self, name: &str) -> Result<String> {
        let reader = self.runtime.container_logs(
            name,
            &LogOptions {
                stdout: true,
                stderr: true,
                tail: Some(self.config.log_tail_lines),
            },
        )?;
        let mut demux = Demuxer::new(reader);
        let (bytes, truncated) = demux.collect_interleaved(self.config.max_log_bytes)?;
        let mut text = String::from_utf8_lossy(&bytes).into_owned();
        if truncated {
            text.push_str("\n[log truncated]\n");
        }
        Ok(text)
    }

    /// Exact-name existence check over the full container list, running or
    /// not. Failures count as absent.
    pub fn container_exists(&self, name: &str) -> bool {
        match self.runtime.list_containers(true) {
            Ok(all) => Self::find(name, &all).is_some(),
            Err(e) => {
                error!(container = name, error = %e, "container_exists failed");
                false
            }
        }
    }

    /// Existence check that additionally requires the container to run the
    /// expected image.
    pub fn container_exists_with_image(&self, name: &str, expected_image: &str) -> bool {
        match self.try_exists_with_image(name, expected_image) {
            Ok(matched) => matched,
            Err(e) => {
                error!(container = name, error = %e, "container_exists_with_image failed");
                false
            }
        }
    }

    fn try_exists_with_image(&self, name: &str, expected_image: &str) -> Result<bool> {
        let all = self.runtime.list_containers(true)?;
        if Self::find(name, &all).is_none() {
            return Ok(false);
        }
        let details = self.runtime.inspect_container(name)?;
        Ok(details.image == expected_image)
    }
}
