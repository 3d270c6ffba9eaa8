//! Unit tests for backend addressing and definition handling.

use rstest::{fixture, rstest};
use serde_json::json;

use super::*;
use crate::definition::RawDefinition;
use crate::machine::{MachineError, OperationOutcome};
use crate::state::{LifecycleState, ResourceId};
use crate::test_support::{Event, TestBed};

#[fixture]
fn bed() -> TestBed {
    TestBed::new().expect("test bed")
}

fn ec2(bed: &TestBed, name: &str, region: &str) -> Ec2Machine {
    let mut machine = Ec2Machine::new(ResourceId::new(name, 2), bed.context());
    let defn = Ec2Definition::from_raw(&RawDefinition::new(
        name,
        json!({"targetEnv": "ec2", "region": region}),
    ))
    .expect("ec2 definition");
    machine.apply_definition(&defn).expect("apply");
    machine
}

#[rstest]
fn none_definition_defaults_target_host_to_name(bed: TestBed) {
    let raw = RawDefinition::new("db", json!({"targetEnv": "none"}));
    let defn = NoneDefinition::from_raw(&raw).expect("definition");
    let mut machine = NoneMachine::new(ResourceId::new("db", 3), bed.context());

    machine.apply_definition(&defn).expect("apply");

    assert_eq!(machine.ssh_name().as_deref(), Some("db"));
    assert_eq!(machine.public_ipv4().as_deref(), Some("db"));
}

#[rstest]
fn applying_a_foreign_definition_names_both_backends(bed: TestBed) {
    let raw = RawDefinition::new("web", json!({"targetEnv": "gce", "region": "europe-west1-b"}));
    let defn = GceDefinition::from_raw(&raw).expect("definition");
    let mut machine = bed.machine("web");

    let err = machine.apply_definition(&defn).expect_err("mismatch");

    assert_eq!(
        err,
        MachineError::DefinitionMismatch {
            machine: String::from("web"),
            expected: "none",
            found: "gce",
        }
    );
}

#[rstest]
fn ec2_requires_region() {
    let raw = RawDefinition::new("web", json!({"targetEnv": "ec2"}));
    assert!(Ec2Definition::from_raw(&raw).is_err());
}

#[rstest]
fn ec2_connects_over_public_address_by_default(bed: TestBed) {
    let mut machine = ec2(&bed, "web", "eu-west-1");
    machine.set_addresses(Some(String::from("198.51.100.1")), Some(String::from("10.0.0.1")));

    assert_eq!(machine.ssh_name().as_deref(), Some("198.51.100.1"));
    assert_eq!(machine.private_network().as_deref(), Some("ec2:eu-west-1"));
}

#[rstest]
fn ec2_can_connect_over_private_address(bed: TestBed) {
    let mut machine = Ec2Machine::new(ResourceId::new("web", 2), bed.context());
    let raw = RawDefinition::new(
        "web",
        json!({"targetEnv": "ec2", "region": "eu-west-1", "usePrivateIpAddress": true}),
    );
    machine
        .apply_definition(&Ec2Definition::from_raw(&raw).expect("definition"))
        .expect("apply");
    machine.set_addresses(Some(String::from("198.51.100.1")), Some(String::from("10.0.0.1")));

    assert_eq!(machine.ssh_name().as_deref(), Some("10.0.0.1"));
}

#[rstest]
#[case::same_region("eu-west-1", "10.0.0.9")]
#[case::other_region("us-east-1", "198.51.100.9")]
fn ec2_peers_use_private_addresses_within_a_region(
    bed: TestBed,
    #[case] peer_region: &str,
    #[case] expected: &str,
) {
    let machine = ec2(&bed, "web", "eu-west-1");
    let mut peer = ec2(&bed, "db", peer_region);
    peer.set_addresses(Some(String::from("198.51.100.9")), Some(String::from("10.0.0.9")));

    assert_eq!(machine.address_to(&peer).as_deref(), Some(expected));
}

#[rstest]
fn ec2_prefers_installed_key_pair_over_recorded_path(bed: TestBed) {
    let mut machine = Ec2Machine::new(ResourceId::new("web", 2), bed.context());
    let raw = RawDefinition::new(
        "web",
        json!({"targetEnv": "ec2", "region": "eu-west-1", "privateKey": "/keys/web"}),
    );
    machine
        .apply_definition(&Ec2Definition::from_raw(&raw).expect("definition"))
        .expect("apply");
    assert_eq!(
        machine.ssh_private_key_file().as_deref().map(|p| p.as_str()),
        Some("/keys/web")
    );

    let installed = machine.write_ssh_private_key("PRIVATE").expect("write key");

    assert_eq!(machine.ssh_private_key_file(), Some(installed.clone()));
    assert!(installed.as_str().ends_with("id_hangar-web"));
    assert_eq!(
        machine.ssh_target().expect("target").identity_file,
        Some(installed)
    );
}

#[rstest]
fn gce_network_defaults_and_scopes_private_addresses(bed: TestBed) {
    let raw = RawDefinition::new("web", json!({"targetEnv": "gce", "region": "europe-west1-b"}));
    let defn = GceDefinition::from_raw(&raw).expect("definition");
    assert_eq!(defn.network, "default");

    let mut machine = GceMachine::new(ResourceId::new("web", 4), bed.context());
    machine.apply_definition(&defn).expect("apply");
    let mut peer = GceMachine::new(ResourceId::new("db", 5), bed.context());
    peer.apply_definition(&defn).expect("apply");
    peer.set_addresses(Some(String::from("203.0.113.5")), Some(String::from("10.240.0.5")));

    assert_eq!(machine.private_network().as_deref(), Some("gce:default"));
    assert_eq!(machine.address_to(&peer).as_deref(), Some("10.240.0.5"));
    assert_eq!(peer.ssh_name().as_deref(), Some("203.0.113.5"));
}

#[rstest]
fn cross_backend_peers_use_public_addresses(bed: TestBed) {
    let machine = ec2(&bed, "web", "eu-west-1");
    let peer = bed.machine("db");

    assert_eq!(machine.address_to(&peer).as_deref(), Some("db.test"));
}

#[rstest]
fn hetzner_uses_main_address_and_quietens_rescue_ssh(bed: TestBed) {
    let raw = RawDefinition::new(
        "bare",
        json!({"targetEnv": "hetzner", "mainIPv4": "192.0.2.10"}),
    );
    let mut machine = HetznerMachine::new(ResourceId::new("bare", 6), bed.context());
    machine
        .apply_definition(&HetznerDefinition::from_raw(&raw).expect("definition"))
        .expect("apply");

    assert_eq!(machine.ssh_name().as_deref(), Some("192.0.2.10"));
    assert!(machine.extra_ssh_flags().is_empty());

    machine.core_mut().state_mut().set_state(LifecycleState::Rescue);
    assert!(machine.extra_ssh_flags().contains(&String::from("LogLevel=quiet")));
}

#[rstest]
#[case::local("localhost", true, None)]
#[case::remote("host1", false, Some("ProxyCommand=ssh -x -a root@host1 nc %h %p"))]
fn container_reaches_remote_hosts_through_a_proxy(
    bed: TestBed,
    #[case] host: &str,
    #[case] fast: bool,
    #[case] proxy: Option<&str>,
) {
    let raw = RawDefinition::new("ct", json!({"targetEnv": "container", "host": host}));
    let mut machine = ContainerMachine::new(ResourceId::new("ct", 8), bed.context());
    machine
        .apply_definition(&ContainerDefinition::from_raw(&raw).expect("definition"))
        .expect("apply");
    machine.set_private_ipv4(Some(String::from("10.233.1.2")));

    assert_eq!(machine.ssh_name().as_deref(), Some("10.233.1.2"));
    assert_eq!(machine.has_really_fast_connection(), fast);
    assert_eq!(machine.extra_ssh_flags().get(1).map(String::as_str), proxy);
}

#[rstest]
fn container_without_address_is_unaddressable(bed: TestBed) {
    let machine = ContainerMachine::new(ResourceId::new("ct", 8), bed.context());
    assert!(machine.ssh_target().is_err());
}

#[rstest]
#[case::libvirtd(VmKind::Libvirtd, "virsh -c qemu:///system start vm-1", "virsh -c qemu:///system shutdown vm-1")]
#[case::virtualbox(
    VmKind::Virtualbox,
    "VBoxManage startvm vm-1 --type headless",
    "VBoxManage controlvm vm-1 acpipowerbutton"
)]
fn local_vms_power_through_the_hypervisor_tool(
    bed: TestBed,
    #[case] kind: VmKind,
    #[case] start: &str,
    #[case] stop: &str,
) {
    let mut machine = LocalVmMachine::new(kind, ResourceId::new("vm", 9), bed.context());
    machine.core_mut().state_mut().set_vm_id(Some(String::from("vm-1")));
    machine.set_private_ipv4(Some(String::from("192.168.56.101")));

    assert_eq!(machine.start().expect("start"), OperationOutcome::Completed);
    assert_eq!(machine.state().state(), LifecycleState::Up);
    assert!(machine.state().ssh_pinged());

    assert_eq!(machine.stop().expect("stop"), OperationOutcome::Completed);
    assert_eq!(machine.state().state(), LifecycleState::Stopped);
    assert!(!machine.state().ssh_pinged());

    let local: Vec<_> = bed
        .log
        .events()
        .into_iter()
        .filter_map(|event| match event {
            Event::Local { command } => Some(command),
            _ => None,
        })
        .collect();
    assert_eq!(local, vec![start.to_owned(), stop.to_owned()]);
    assert!(machine.has_really_fast_connection());
    assert_eq!(machine.kind(), kind.tag());
}

#[rstest]
fn local_vm_without_identifier_cannot_start(bed: TestBed) {
    let mut machine =
        LocalVmMachine::new(VmKind::Virtualbox, ResourceId::new("vm", 9), bed.context());

    let err = machine.start().expect_err("no vm id");

    assert!(matches!(err, MachineError::VmControl { .. }));
    assert!(bed.log.events().is_empty());
}

#[rstest]
fn local_vm_rejects_definition_for_other_hypervisor(bed: TestBed) {
    let raw = RawDefinition::new("vm", json!({"targetEnv": "libvirtd", "memorySize": 1024}));
    let defn = LocalVmDefinition::from_raw(VmKind::Libvirtd, &raw).expect("definition");
    let mut machine =
        LocalVmMachine::new(VmKind::Virtualbox, ResourceId::new("vm", 9), bed.context());

    let err = machine.apply_definition(&defn).expect_err("mismatch");

    assert!(matches!(
        err,
        MachineError::DefinitionMismatch { expected: "virtualbox", found: "libvirtd", .. }
    ));
}
