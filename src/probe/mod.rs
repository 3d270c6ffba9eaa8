//! Health checks: reachability, load average and systemd unit states.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, warn};

use crate::machine::Machine;
use crate::ssh::RemoteCommand;
use crate::state::LifecycleState;

const LOAD_QUERY: &str = "cat /proc/loadavg";
const LOAD_QUERY_TIMEOUT: Duration = Duration::from_secs(15);
const UNIT_QUERY: &str = "systemctl --all --full --no-legend";

/// Mount units systemd tries to start even when the filesystem does not
/// exist; their inactive state is not a failure.
const IGNORED_MOUNT_PREFIXES: [&str; 2] = ["sys-", "dev-"];

#[expect(clippy::expect_used, reason = "pattern is a compile-time constant")]
static FAILED_UNIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^ ]+) .* failed .*$").expect("valid failed-unit pattern"));

#[expect(clippy::expect_used, reason = "pattern is a compile-time constant")]
static ACTIVATING_UNIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([^ ]+) .* activating .*$").expect("valid activating-unit pattern")
});

#[expect(clippy::expect_used, reason = "pattern is a compile-time constant")]
static INACTIVE_MOUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([^.]+\.mount) .* inactive .*$").expect("valid inactive-mount pattern")
});

/// Outcome of a health check. `None` means "not determined".
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CheckResult {
    /// Whether the resource exists.
    pub exists: Option<bool>,
    /// Whether the machine is running.
    pub is_up: Option<bool>,
    /// Whether SSH answered.
    pub is_reachable: Option<bool>,
    /// Whether the expected disks are attached.
    pub disks_ok: Option<bool>,
    /// Units in a failed state.
    pub failed_units: Option<Vec<String>>,
    /// Units still activating.
    pub in_progress_units: Option<Vec<String>>,
    /// 1, 5 and 15 minute load averages.
    pub load: Option<[f64; 3]>,
    /// Human readable problems found while checking.
    pub messages: Vec<String>,
}

/// Units classified from `systemctl` output.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UnitReport {
    /// Units in a failed state, including inactive real mounts.
    pub failed: Vec<String>,
    /// Units still activating.
    pub in_progress: Vec<String>,
}

/// Classifies `systemctl --all --full --no-legend` output.
#[must_use]
pub fn parse_units(output: &str) -> UnitReport {
    let mut report = UnitReport::default();
    for raw in output.lines() {
        let line = raw.trim_start_matches(['●', ' ']);
        if let Some(unit) = first_capture(&FAILED_UNIT, line) {
            report.failed.push(unit.to_owned());
        }
        if let Some(unit) = first_capture(&ACTIVATING_UNIT, line) {
            report.in_progress.push(unit.to_owned());
        }
        if let Some(unit) = first_capture(&INACTIVE_MOUNT, line)
            && !IGNORED_MOUNT_PREFIXES
                .iter()
                .any(|prefix| unit.starts_with(prefix))
        {
            report.failed.push(unit.to_owned());
        }
    }
    report
}

fn first_capture<'a>(pattern: &Regex, line: &'a str) -> Option<&'a str> {
    pattern
        .captures(line)
        .and_then(|captures| captures.get(1))
        .map(|unit| unit.as_str())
}

/// Parses the first three fields of `/proc/loadavg`.
#[must_use]
pub fn parse_load(output: &str) -> Option<[f64; 3]> {
    let mut fields = output.split_whitespace().map(str::parse::<f64>);
    let one = fields.next()?.ok()?;
    let five = fields.next()?.ok()?;
    let fifteen = fields.next()?.ok()?;
    Some([one, five, fifteen])
}

/// Queries the load average; any transport or command failure yields `None`.
#[must_use]
pub fn load_average<M: Machine + ?Sized>(machine: &M) -> Option<[f64; 3]> {
    let command = RemoteCommand::new(LOAD_QUERY)
        .captured()
        .with_timeout(LOAD_QUERY_TIMEOUT);
    match machine.run_command(command) {
        Ok(output) => parse_load(&output.stdout),
        Err(err) => {
            debug!(machine = machine.name(), error = %err, "load average query failed");
            None
        }
    }
}

/// Checks the machine, updating its lifecycle state.
///
/// An unanswered load query demotes an UP machine to UNREACHABLE; any other
/// state is left alone. A successful query marks the machine UP and
/// reachable, then collects the unit report.
pub fn check<M: Machine + ?Sized>(machine: &mut M) -> CheckResult {
    let mut result = CheckResult::default();

    let Some(load) = machine.load_average() else {
        let state = machine.core_mut().state_mut();
        if state.state() == LifecycleState::Up {
            state.set_state(LifecycleState::Unreachable);
        }
        result.is_reachable = Some(false);
        return result;
    };

    machine.core_mut().mark_up();
    result.is_reachable = Some(true);
    result.load = Some(load);

    match machine.run_command(RemoteCommand::new(UNIT_QUERY).captured()) {
        Ok(output) => {
            let report = parse_units(&output.stdout);
            result.failed_units = Some(report.failed);
            result.in_progress_units = Some(report.in_progress);
        }
        Err(err) => {
            warn!(machine = machine.name(), error = %err, "unable to query systemd units");
            result
                .messages
                .push(format!("unable to query systemd units: {err}"));
        }
    }
    result
}
