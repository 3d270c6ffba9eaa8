//! Tests for layered configuration and its validation messages.

use hangar::config::{ConfigError, SshConfig, ToolchainConfig};
use hangar::test_support::EnvGuard;
use rstest::*;

fn assert_actionable(error: &ConfigError, env_var: &str, toml_key: &str) {
    let ConfigError::MissingField(message) = error else {
        panic!("expected MissingField error, got {error:?}");
    };
    assert!(
        message.contains(env_var),
        "error should mention env var {env_var}: {message}"
    );
    assert!(
        message.contains("hangar.toml"),
        "error should mention config file: {message}"
    );
    assert!(
        message.contains(toml_key),
        "error should mention TOML key {toml_key}: {message}"
    );
}

#[test]
fn standard_configs_validate() {
    SshConfig::standard()
        .validate()
        .unwrap_or_else(|err| panic!("ssh defaults should validate: {err}"));
    ToolchainConfig::standard()
        .validate()
        .unwrap_or_else(|err| panic!("toolchain defaults should validate: {err}"));
}

#[rstest]
#[case::ssh_bin("HANGAR_SSH_SSH_BIN", "ssh_bin")]
#[case::scp_bin("HANGAR_SSH_SCP_BIN", "scp_bin")]
#[case::ssh_user("HANGAR_SSH_SSH_USER", "ssh_user")]
#[case::known_hosts("HANGAR_SSH_SSH_KNOWN_HOSTS_FILE", "ssh_known_hosts_file")]
fn blank_ssh_fields_are_rejected_with_actionable_errors(
    #[case] env_var: &str,
    #[case] toml_key: &str,
) {
    let mut cfg = SshConfig::standard();
    match toml_key {
        "ssh_bin" => cfg.ssh_bin = String::from("  "),
        "scp_bin" => cfg.scp_bin.clear(),
        "ssh_user" => cfg.ssh_user.clear(),
        _ => cfg.ssh_known_hosts_file.clear(),
    }

    let error = cfg.validate().expect_err("blank field should be rejected");

    assert_actionable(&error, env_var, toml_key);
}

#[rstest]
#[case::nix_store("HANGAR_TOOLS_NIX_STORE_BIN", "nix_store_bin")]
#[case::nix_copy_closure("HANGAR_TOOLS_NIX_COPY_CLOSURE_BIN", "nix_copy_closure_bin")]
#[case::ssh_keygen("HANGAR_TOOLS_SSH_KEYGEN_BIN", "ssh_keygen_bin")]
#[case::virsh("HANGAR_TOOLS_VIRSH_BIN", "virsh_bin")]
#[case::vboxmanage("HANGAR_TOOLS_VBOXMANAGE_BIN", "vboxmanage_bin")]
fn blank_tool_paths_are_rejected_with_actionable_errors(
    #[case] env_var: &str,
    #[case] toml_key: &str,
) {
    let mut cfg = ToolchainConfig::standard();
    match toml_key {
        "nix_store_bin" => cfg.nix_store_bin.clear(),
        "nix_copy_closure_bin" => cfg.nix_copy_closure_bin.clear(),
        "ssh_keygen_bin" => cfg.ssh_keygen_bin.clear(),
        "virsh_bin" => cfg.virsh_bin.clear(),
        _ => cfg.vboxmanage_bin.clear(),
    }

    let error = cfg.validate().expect_err("blank tool should be rejected");

    assert_actionable(&error, env_var, toml_key);
}

#[test]
fn zero_substitution_jobs_are_rejected() {
    let cfg = ToolchainConfig {
        substitute_jobs: 0,
        ..ToolchainConfig::standard()
    };

    let error = cfg.validate().expect_err("zero jobs should be rejected");

    assert_actionable(&error, "HANGAR_TOOLS_SUBSTITUTE_JOBS", "substitute_jobs");
}

#[test]
fn blank_identity_file_is_rejected() {
    let cfg = SshConfig {
        ssh_identity_file: Some(String::from(" ")),
        ..SshConfig::standard()
    };

    let error = cfg.validate().expect_err("blank identity should be rejected");

    assert_actionable(&error, "HANGAR_SSH_SSH_IDENTITY_FILE", "ssh_identity_file");
}

#[test]
fn connect_timeout_is_exposed_as_a_duration() {
    let cfg = SshConfig {
        connect_timeout_secs: 3,
        ..SshConfig::standard()
    };
    assert_eq!(cfg.connect_timeout().as_secs(), 3);
}

#[test]
fn environment_overrides_ssh_defaults() {
    let _guard = EnvGuard::set_vars(&[
        ("HANGAR_SSH_SSH_USER", "deploy"),
        ("HANGAR_SSH_CONNECT_TIMEOUT_SECS", "30"),
    ]);

    let cfg = SshConfig::load_without_cli_args()
        .unwrap_or_else(|err| panic!("config should load: {err}"));

    assert_eq!(cfg.ssh_user, "deploy");
    assert_eq!(cfg.connect_timeout_secs, 30);
    assert_eq!(cfg.ssh_bin, "ssh");
}

#[test]
fn environment_overrides_toolchain_defaults() {
    let _guard = EnvGuard::set_vars(&[("HANGAR_TOOLS_SUBSTITUTE_JOBS", "8")]);

    let cfg = ToolchainConfig::load_without_cli_args()
        .unwrap_or_else(|err| panic!("config should load: {err}"));

    assert_eq!(cfg.substitute_jobs, 8);
    assert_eq!(cfg.nix_store_bin, "nix-store");
}
