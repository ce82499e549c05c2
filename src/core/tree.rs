//! Process tree termination
//!
//! Two phases with strict ordering: enumerate every descendant, send SIGTERM
//! to all of them and the root, wait out the grace period, then SIGKILL
//! whatever is left.

use std::collections::{HashMap, HashSet};
use std::process::Child;
use std::thread;
use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use tracing::{debug, warn};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// What happened during a termination pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TerminationReport {
    /// Every pid that received SIGTERM, root last
    pub signalled: Vec<u32>,
    /// Pids still alive after the grace period
    pub force_killed: Vec<u32>,
}

/// All transitive children of `root`, excluding `root` itself.
pub fn descendants(system: &mut System, root: u32) -> Vec<u32> {
    system.refresh_processes(ProcessesToUpdate::All, true);

    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (pid, process) in system.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*pid);
        }
    }

    let root = Pid::from_u32(root);
    let mut stack = vec![root];
    let mut seen: HashSet<Pid> = HashSet::new();
    let mut ordered = Vec::new();
    while let Some(current) = stack.pop() {
        if !seen.insert(current) {
            continue;
        }
        if current != root {
            ordered.push(current.as_u32());
        }
        if let Some(kids) = children.get(&current) {
            stack.extend(kids.iter().filter(|k| !seen.contains(*k)));
        }
    }
    ordered
}

fn is_running(system: &mut System, pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system
        .process(pid)
        .map(|p| p.status() != ProcessStatus::Zombie)
        .unwrap_or(false)
}

fn signal(pid: u32, sig: libc::c_int) {
    let rc = unsafe { libc::kill(pid as libc::pid_t, sig) };
    if rc != 0 {
        debug!("kill({}, {}) failed: {}", pid, sig, std::io::Error::last_os_error());
    }
}

/// Terminate `child` and its whole tree.
///
/// Returns immediately with an empty report when the child already exited.
pub fn terminate_tree(child: &mut Child, grace: Duration) -> TerminationReport {
    let mut report = TerminationReport::default();

    if !matches!(child.try_wait(), Ok(None)) {
        return report;
    }

    let root = child.id();
    let mut system = System::new();
    let mut procs = descendants(&mut system, root);
    procs.push(root);

    for &pid in &procs {
        signal(pid, libc::SIGTERM);
    }
    report.signalled = procs.clone();

    // The root is our own child, so it must be reaped through `try_wait`;
    // descendants are reaped by whoever adopted them.
    let deadline = Instant::now() + grace;
    let mut alive = procs;
    loop {
        alive.retain(|&pid| {
            if pid == root {
                matches!(child.try_wait(), Ok(None))
            } else {
                is_running(&mut system, pid)
            }
        });
        if alive.is_empty() || Instant::now() >= deadline {
            break;
        }
        thread::sleep(EXIT_POLL_INTERVAL);
    }

    for &pid in &alive {
        warn!("Process {} ignored SIGTERM, sending SIGKILL", pid);
        signal(pid, libc::SIGKILL);
    }
    if alive.contains(&root) {
        let _ = child.wait();
    }
    report.force_killed = alive;
    report
}
