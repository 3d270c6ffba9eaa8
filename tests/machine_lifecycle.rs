//! Behavioural tests driving machines built by the registry through a
//! deployment's lifecycle against scripted capabilities.

use camino::Utf8Path;
use hangar::backends::NoneMachine;
use hangar::test_support::{Event, TestBed};
use hangar::{
    DefinitionRecord, LifecycleState, Machine, MemoryStore, RawDefinition, ResourceId,
    ResourceState, create_definition, create_state,
};
use rstest::{fixture, rstest};
use serde_json::json;

const LOADAVG: &str = "0.10 0.20 0.30 1/99 1234\n";

#[fixture]
fn bed() -> TestBed {
    let bed = TestBed::new().unwrap_or_else(|err| panic!("test bed: {err}"));
    bed.shell.respond("/proc/loadavg", 0, LOADAVG);
    bed
}

fn deployed(bed: &TestBed, attrs: serde_json::Value) -> Box<dyn Machine> {
    let raw = RawDefinition::new("web", attrs);
    let DefinitionRecord::Machine(defn) =
        create_definition(&raw).unwrap_or_else(|err| panic!("definition: {err}"))
    else {
        panic!("expected a machine definition");
    };
    let ResourceState::Machine(mut machine) =
        create_state(defn.target_env(), ResourceId::new("web", 1), bed.context())
            .unwrap_or_else(|err| panic!("state: {err}"))
    else {
        panic!("expected a machine state");
    };
    machine
        .apply_definition(defn.as_ref())
        .unwrap_or_else(|err| panic!("apply: {err}"));
    machine
}

#[rstest]
fn fresh_host_is_checked_provisioned_and_activated(bed: TestBed) {
    let mut machine = deployed(
        &bed,
        json!({
            "targetEnv": "none",
            "targetHost": "203.0.113.20",
            "storeKeysOnMachine": false,
            "keys": {"db-password": {"text": "hunter2", "user": "postgres"}},
        }),
    );
    assert_eq!(machine.state().state(), LifecycleState::Missing);

    let result = machine.check();
    assert_eq!(result.is_reachable, Some(true));
    assert_eq!(machine.state().state(), LifecycleState::Up);

    machine
        .send_keys()
        .unwrap_or_else(|err| panic!("send keys: {err}"));
    machine
        .copy_closure_to(Utf8Path::new("/nix/store/abcd-nixos-system"))
        .unwrap_or_else(|err| panic!("copy closure: {err}"));
    let status = machine
        .switch_to_configuration("switch", true, None)
        .unwrap_or_else(|err| panic!("switch: {err}"));
    assert_eq!(status, 0);

    let hosts: Vec<_> = bed
        .log
        .events()
        .into_iter()
        .filter_map(|event| match event {
            Event::Remote { host, .. } | Event::Upload { host, .. } => Some(host),
            _ => None,
        })
        .collect();
    assert!(!hosts.is_empty());
    assert!(hosts.iter().all(|host| host == "203.0.113.20"));

    let commands = bed.log.remote_commands();
    assert!(commands.contains(&String::from("touch /run/keys/done")));
    assert!(
        commands
            .last()
            .is_some_and(|last| last.ends_with("switch-to-configuration switch"))
    );
}

#[rstest]
fn lost_machine_is_demoted_then_recovered_by_reboot(bed: TestBed) {
    let mut machine = deployed(
        &bed,
        json!({"targetEnv": "none", "targetHost": "203.0.113.21"}),
    );
    machine.check();
    assert_eq!(machine.state().state(), LifecycleState::Up);

    bed.shell.refuse_connections();
    let result = machine.check();
    assert_eq!(result.is_reachable, Some(false));
    assert_eq!(machine.state().state(), LifecycleState::Unreachable);

    bed.shell.reset_rules();
    bed.shell.respond("/proc/loadavg", 0, LOADAVG);
    machine
        .reboot_sync(true)
        .unwrap_or_else(|err| panic!("reboot_sync: {err}"));
    assert_eq!(machine.state().state(), LifecycleState::Up);
    assert!(machine.state().ssh_pinged());
}

#[rstest]
fn rescue_session_never_provisions_keys(bed: TestBed) {
    let mut machine = deployed(
        &bed,
        json!({
            "targetEnv": "none",
            "storeKeysOnMachine": false,
            "keys": {"token": {"text": "abc"}},
        }),
    );
    machine
        .core_mut()
        .state_mut()
        .set_state(LifecycleState::Rescue);

    machine
        .send_keys()
        .unwrap_or_else(|err| panic!("send keys: {err}"));
    assert_eq!(machine.load_average(), Some([0.10, 0.20, 0.30]));
    machine
        .reboot(false)
        .unwrap_or_else(|err| panic!("reboot: {err}"));

    assert_eq!(
        bed.log.remote_commands(),
        vec![
            String::from("export LANG= LC_ALL= LC_TIME=; cat /proc/loadavg"),
            String::from("export LANG= LC_ALL= LC_TIME=; (sleep 2; reboot) &"),
        ]
    );
    assert_eq!(machine.state().state(), LifecycleState::Starting);
}

#[rstest]
fn state_survives_a_save_and_reload(bed: TestBed) {
    let store = MemoryStore::new();
    let mut machine = deployed(
        &bed,
        json!({"targetEnv": "none", "targetHost": "198.51.100.30", "targetPort": 2022}),
    );
    machine.check();
    machine
        .core_mut()
        .save(&store)
        .unwrap_or_else(|err| panic!("save: {err}"));

    let mut reloaded = NoneMachine::new(ResourceId::new("web", 1), bed.context());
    reloaded
        .core_mut()
        .load(&store)
        .unwrap_or_else(|err| panic!("load: {err}"));

    assert_eq!(reloaded.target_host(), Some("198.51.100.30"));
    assert_eq!(reloaded.state().ssh_port(), 2022);
    assert_eq!(reloaded.state().state(), LifecycleState::Up);
    assert!(reloaded.state().ssh_pinged());
    assert!(!reloaded.core().pinged_this_time());
}

#[rstest]
fn vpn_key_is_provisioned_once(bed: TestBed) {
    bed.shell.respond("test -f", 1, "");
    let mut machine = deployed(&bed, json!({"targetEnv": "none"}));

    machine
        .generate_vpn_key()
        .unwrap_or_else(|err| panic!("vpn key: {err}"));
    let public = machine.state().public_vpn_key().map(str::to_owned);
    assert!(public.is_some());

    bed.shell.reset_rules();
    bed.log.clear();
    machine
        .generate_vpn_key()
        .unwrap_or_else(|err| panic!("vpn key: {err}"));

    assert_eq!(bed.log.remote_commands().len(), 1);
    assert_eq!(machine.state().public_vpn_key().map(str::to_owned), public);
}
