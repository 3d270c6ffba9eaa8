//! Configuration loading via `ortho-config`.
//!
//! Two layered structures drive the process-backed capabilities: [`SshConfig`]
//! for the `ssh`/`scp` transport and [`ToolchainConfig`] for the local store
//! and key tooling. Both merge defaults, configuration files, and environment
//! variables in that order of precedence.

use std::ffi::OsString;
use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

const APP_NAME: &str = "hangar";

/// SSH transport settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "HANGAR_SSH",
    discovery(
        app_name = "hangar",
        env_var = "HANGAR_CONFIG_PATH",
        config_file_name = "hangar.toml",
        dotfile_name = ".hangar.toml",
        project_file_name = "hangar.toml"
    )
)]
pub struct SshConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    #[ortho_config(default = "scp".to_owned())]
    pub scp_bin: String,
    /// Remote user to connect as.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_user: String,
    /// Whether to force batch mode for SSH to avoid password prompts.
    #[ortho_config(default = true)]
    pub ssh_batch_mode: bool,
    /// Whether to enforce host key checking. Freshly created machines present
    /// unknown host keys, so checking is off by default.
    #[ortho_config(default = false)]
    pub ssh_strict_host_key_checking: bool,
    /// Known hosts file override.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub ssh_known_hosts_file: String,
    /// Private key used when a machine does not supply its own. Supports
    /// tilde expansion.
    pub ssh_identity_file: Option<String>,
    /// Seconds allowed for the TCP and SSH handshake.
    #[ortho_config(default = 10)]
    pub connect_timeout_secs: u64,
    /// Control socket template (for example `~/.ssh/hangar-%C`). When set,
    /// connections are multiplexed and can be reset after a reboot.
    pub control_path: Option<String>,
}

impl SshConfig {
    /// Returns the defaults used when no configuration source overrides them.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            scp_bin: String::from("scp"),
            ssh_user: String::from("root"),
            ssh_batch_mode: true,
            ssh_strict_host_key_checking: false,
            ssh_known_hosts_file: String::from("/dev/null"),
            ssh_identity_file: None,
            connect_timeout_secs: 10,
            control_path: None,
        }
    }

    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from(APP_NAME)])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Returns the handshake timeout as a [`Duration`].
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty
    /// or the connect timeout is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(&self.ssh_bin, &FieldMetadata::ssh("ssh client", "ssh_bin"))?;
        require_field(&self.scp_bin, &FieldMetadata::ssh("scp client", "scp_bin"))?;
        require_field(&self.ssh_user, &FieldMetadata::ssh("SSH user", "ssh_user"))?;
        require_field(
            &self.ssh_known_hosts_file,
            &FieldMetadata::ssh("known hosts file", "ssh_known_hosts_file"),
        )?;
        if let Some(identity) = self.ssh_identity_file.as_deref() {
            require_field(
                identity,
                &FieldMetadata::ssh("SSH identity file", "ssh_identity_file"),
            )?;
        }
        if let Some(control) = self.control_path.as_deref() {
            require_field(
                control,
                &FieldMetadata::ssh("SSH control path", "control_path"),
            )?;
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::MissingField(
                FieldMetadata::ssh("non-zero connect timeout", "connect_timeout_secs").message(),
            ));
        }
        Ok(())
    }
}

/// Local tooling used for closure queries, closure copies and key generation.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "HANGAR_TOOLS",
    discovery(
        app_name = "hangar",
        env_var = "HANGAR_CONFIG_PATH",
        config_file_name = "hangar.toml",
        dotfile_name = ".hangar.toml",
        project_file_name = "hangar.toml"
    )
)]
pub struct ToolchainConfig {
    /// Path to the `nix-store` executable.
    #[ortho_config(default = "nix-store".to_owned())]
    pub nix_store_bin: String,
    /// Path to the `nix-copy-closure` executable.
    #[ortho_config(default = "nix-copy-closure".to_owned())]
    pub nix_copy_closure_bin: String,
    /// Path to the `ssh-keygen` executable.
    #[ortho_config(default = "ssh-keygen".to_owned())]
    pub ssh_keygen_bin: String,
    /// Path to the `virsh` executable driving libvirtd guests.
    #[ortho_config(default = "virsh".to_owned())]
    pub virsh_bin: String,
    /// Libvirt connection URI.
    #[ortho_config(default = "qemu:///system".to_owned())]
    pub libvirt_uri: String,
    /// Path to the `VBoxManage` executable.
    #[ortho_config(default = "VBoxManage".to_owned())]
    pub vboxmanage_bin: String,
    /// Parallel jobs the target uses when realising paths from substituters.
    #[ortho_config(default = 4)]
    pub substitute_jobs: u32,
}

impl ToolchainConfig {
    /// Returns the stock tool names resolved through `PATH`.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            nix_store_bin: String::from("nix-store"),
            nix_copy_closure_bin: String::from("nix-copy-closure"),
            ssh_keygen_bin: String::from("ssh-keygen"),
            virsh_bin: String::from("virsh"),
            libvirt_uri: String::from("qemu:///system"),
            vboxmanage_bin: String::from("VBoxManage"),
            substitute_jobs: 4,
        }
    }

    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from(APP_NAME)])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty
    /// or no substitution jobs are allowed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.nix_store_bin,
            &FieldMetadata::tools("nix-store binary", "nix_store_bin"),
        )?;
        require_field(
            &self.nix_copy_closure_bin,
            &FieldMetadata::tools("nix-copy-closure binary", "nix_copy_closure_bin"),
        )?;
        require_field(
            &self.ssh_keygen_bin,
            &FieldMetadata::tools("ssh-keygen binary", "ssh_keygen_bin"),
        )?;
        require_field(
            &self.virsh_bin,
            &FieldMetadata::tools("virsh binary", "virsh_bin"),
        )?;
        require_field(
            &self.libvirt_uri,
            &FieldMetadata::tools("libvirt connection URI", "libvirt_uri"),
        )?;
        require_field(
            &self.vboxmanage_bin,
            &FieldMetadata::tools("VBoxManage binary", "vboxmanage_bin"),
        )?;
        if self.substitute_jobs == 0 {
            return Err(ConfigError::MissingField(
                FieldMetadata::tools("non-zero substitution job count", "substitute_jobs")
                    .message(),
            ));
        }
        Ok(())
    }
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_prefix: &'static str,
    toml_key: &'static str,
    section: &'static str,
}

impl FieldMetadata {
    const fn ssh(description: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_prefix: "HANGAR_SSH",
            toml_key,
            section: "ssh",
        }
    }

    const fn tools(description: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_prefix: "HANGAR_TOOLS",
            toml_key,
            section: "tools",
        }
    }

    fn message(&self) -> String {
        format!(
            "missing {}: set {}_{} or add {} to [{}] in hangar.toml",
            self.description,
            self.env_prefix,
            self.toml_key.to_uppercase(),
            self.toml_key,
            self.section
        )
    }
}

fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(metadata.message()));
    }
    Ok(())
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
