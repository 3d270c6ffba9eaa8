//! Unit tests for closure transfer policy.

use camino::Utf8Path;
use rstest::{fixture, rstest};

use super::*;
use crate::backends::{ContainerDefinition, ContainerMachine};
use crate::definition::RawDefinition;
use crate::state::ResourceId;
use crate::test_support::{Event, TestBed};

const TOPLEVEL: &str = "/nix/store/aaaa-nixos-system";

#[fixture]
fn bed() -> TestBed {
    let bed = TestBed::new().expect("test bed");
    bed.store.with_closure(
        TOPLEVEL,
        &[TOPLEVEL, "/nix/store/bbbb-glibc", "/nix/store/cccc-it's-quoted"],
    );
    bed
}

fn local_container(bed: &TestBed) -> ContainerMachine {
    let mut machine = ContainerMachine::new(ResourceId::new("ct", 5), bed.context());
    let raw = RawDefinition::new("ct", serde_json::json!({"targetEnv": "container"}));
    machine
        .apply_definition(&ContainerDefinition::from_raw(&raw).expect("definition"))
        .expect("apply");
    machine.set_private_ipv4(Some(String::from("10.233.0.2")));
    machine
}

#[rstest]
fn slow_links_try_substituters_before_a_compressed_copy(bed: TestBed) {
    let machine = bed.machine("web");

    machine
        .copy_closure_to(Utf8Path::new(TOPLEVEL))
        .expect("copy closure");

    let events = bed.log.events();
    assert_eq!(events.len(), 3);
    assert_eq!(
        events[0],
        Event::ClosureQuery {
            path: TOPLEVEL.into()
        }
    );
    let Event::Remote { command, .. } = &events[1] else {
        panic!("expected the substituter pass, got {:?}", events[1]);
    };
    assert!(command.starts_with("nix-store -j 4 -r --ignore-unknown "));
    assert!(command.contains("/nix/store/bbbb-glibc"));
    assert!(command.contains(&escape("/nix/store/cccc-it's-quoted".into()).into_owned()));
    assert_eq!(
        events[2],
        Event::ClosureCopy {
            host: String::from("web.test"),
            path: TOPLEVEL.into(),
            compress: true,
        }
    );
}

#[rstest]
fn fast_links_copy_directly_without_compression(bed: TestBed) {
    let machine = local_container(&bed);

    machine
        .copy_closure_to(Utf8Path::new(TOPLEVEL))
        .expect("copy closure");

    assert_eq!(
        bed.log.events(),
        vec![Event::ClosureCopy {
            host: String::from("10.233.0.2"),
            path: TOPLEVEL.into(),
            compress: false,
        }]
    );
}

#[rstest]
fn substituter_failures_do_not_stop_the_copy(bed: TestBed) {
    bed.shell.respond("nix-store -j", 1, "");
    let machine = bed.machine("web");

    machine
        .copy_closure_to(Utf8Path::new(TOPLEVEL))
        .expect("copy closure");

    assert!(matches!(
        bed.log.events().last(),
        Some(Event::ClosureCopy { compress: true, .. })
    ));
}

#[rstest]
fn copy_failures_propagate(bed: TestBed) {
    bed.store.fail_copy_of(TOPLEVEL);
    let machine = bed.machine("web");

    let err = machine
        .copy_closure_to(Utf8Path::new(TOPLEVEL))
        .expect_err("copy fails");

    assert!(matches!(
        err,
        MachineError::Store(StoreError::CommandFailure { .. })
    ));
}

#[rstest]
fn substitution_job_count_follows_the_toolchain(bed: TestBed) {
    let mut context = bed.context();
    context.toolchain.substitute_jobs = 16;
    let mut machine = crate::backends::NoneMachine::new(ResourceId::new("web", 1), context);
    machine.set_target_host(Some(String::from("web.test")));

    machine
        .copy_closure_to(Utf8Path::new(TOPLEVEL))
        .expect("copy closure");

    assert!(bed.log.remote_commands()[0].starts_with("nix-store -j 16 "));
}

#[rstest]
fn unaddressable_machine_copies_nothing(bed: TestBed) {
    let mut machine = bed.machine("web");
    machine.set_target_host(None);

    let err = machine
        .copy_closure_to(Utf8Path::new(TOPLEVEL))
        .expect_err("no address");

    assert!(matches!(err, MachineError::Ssh(_)));
    assert!(bed.log.events().is_empty());
}

mod nix_store {
    use camino::{Utf8Path, Utf8PathBuf};
    use rstest::rstest;

    use super::TOPLEVEL;
    use crate::closure::{ClosureStore, NixStore, StoreError};
    use crate::config::{SshConfig, ToolchainConfig};
    use crate::ssh::SshTarget;
    use crate::test_support::ScriptedRunner;

    fn store(runner: &ScriptedRunner) -> NixStore<ScriptedRunner> {
        NixStore::new(ToolchainConfig::standard(), SshConfig::standard(), runner.clone())
    }

    fn args(spec: &crate::runner::CommandSpec) -> Vec<String> {
        spec.args
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[rstest]
    fn closure_query_lists_store_paths() {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(0), format!("{TOPLEVEL}\n/nix/store/bbbb-glibc\n\n"), "");

        let closure = store(&runner)
            .query_dependency_closure(Utf8Path::new(TOPLEVEL))
            .expect("query");

        assert_eq!(
            closure,
            vec![Utf8PathBuf::from(TOPLEVEL), Utf8PathBuf::from("/nix/store/bbbb-glibc")]
        );
        let invocations = runner.invocations();
        assert_eq!(invocations[0].program, "nix-store");
        assert_eq!(args(&invocations[0]), vec!["-qR", TOPLEVEL]);
    }

    #[rstest]
    #[case::compressed(true, vec!["--to", "root@web.test", TOPLEVEL, "--gzip"])]
    #[case::plain(false, vec!["--to", "root@web.test", TOPLEVEL])]
    fn copy_passes_ssh_options_through_the_environment(
        #[case] compress: bool,
        #[case] expected: Vec<&str>,
    ) {
        let runner = ScriptedRunner::new();
        runner.push_success();

        store(&runner)
            .copy_closure_to(
                &SshTarget::new("web.test", 2222),
                Utf8Path::new(TOPLEVEL),
                compress,
            )
            .expect("copy");

        let invocations = runner.invocations();
        let spec = &invocations[0];
        assert_eq!(spec.program, "nix-copy-closure");
        assert_eq!(args(spec), expected);
        let (name, value) = &spec.env[0];
        assert_eq!(name, "NIX_SSHOPTS");
        assert!(value.starts_with("-p 2222 "));
        assert!(value.contains("BatchMode=yes"));
    }

    #[rstest]
    fn ssh_options_with_spaces_stay_single_words() {
        let runner = ScriptedRunner::new();
        runner.push_success();
        let mut target = SshTarget::new("10.0.0.2", 22);
        target.extra_flags = vec![
            String::from("-o"),
            String::from("ProxyCommand=ssh -x -a root@host nc %h %p"),
        ];

        store(&runner)
            .copy_closure_to(&target, Utf8Path::new(TOPLEVEL), false)
            .expect("copy");

        let invocations = runner.invocations();
        let (_, value) = &invocations[0].env[0];
        assert!(value.contains("'ProxyCommand=ssh -x -a root@host nc %h %p'"));
    }

    #[rstest]
    fn failing_tool_reports_status_and_stderr() {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(1), "", "error: path is not valid\n");

        let err = store(&runner)
            .query_dependency_closure(Utf8Path::new(TOPLEVEL))
            .expect_err("failure");

        assert_eq!(
            err,
            StoreError::CommandFailure {
                program: String::from("nix-store"),
                status: String::from("1"),
                stderr: String::from("error: path is not valid"),
            }
        );
    }
}
