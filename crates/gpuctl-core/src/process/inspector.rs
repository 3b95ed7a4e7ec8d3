//! Process discovery is inherently racy, so tests should stub this
//! interface rather than depend on real processes.

use std::collections::HashMap;
use std::sync::Mutex;

use sysinfo::System;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

/// A process as seen on the OS process table: pid, full command line, and
/// parent pid (used to walk descendants).
#[derive(Debug, Clone)]
pub struct OsProcess {
    pub pid: u32,
    pub argv: Vec<String>,
    pub ppid: Option<u32>,
}

pub trait ProcessInspector: Send + Sync {
    fn list_processes(&self) -> Vec<OsProcess>;
    fn pid_exists(&self, pid: u32) -> bool;

    /// All descendants of `pid` (not including `pid` itself), any depth.
    fn descendants(&self, pid: u32) -> Vec<u32> {
        let procs = self.list_processes();
        let mut children_of: HashMap<u32, Vec<u32>> = HashMap::new();
        for p in &procs {
            if let Some(ppid) = p.ppid {
                children_of.entry(ppid).or_default().push(p.pid);
            }
        }
        let mut out = Vec::new();
        let mut stack = vec![pid];
        while let Some(cur) = stack.pop() {
            if let Some(kids) = children_of.get(&cur) {
                for &kid in kids {
                    out.push(kid);
                    stack.push(kid);
                }
            }
        }
        out
    }

    /// Returns true if the pid existed (signal delivery is best-effort after
    /// that; Kill(pid, force) is always reported as success regardless).
    fn send_signal(&self, pid: u32, signal: Signal) -> bool;
}

/// Real, OS-backed inspector built on `sysinfo::System`.
#[derive(Default)]
pub struct SysinfoInspector;

impl ProcessInspector for SysinfoInspector {
    fn list_processes(&self) -> Vec<OsProcess> {
        let mut sys = System::new_all();
        sys.refresh_all();
        sys.processes()
            .values()
            .map(|p| OsProcess {
                pid: p.pid().as_u32(),
                argv: p
                    .cmd()
                    .iter()
                    .map(|s| s.to_string_lossy().into_owned())
                    .collect(),
                ppid: p.parent().map(|pp| pp.as_u32()),
            })
            .collect()
    }

    fn pid_exists(&self, pid: u32) -> bool {
        let mut sys = System::new_all();
        sys.refresh_all();
        sys.process(sysinfo::Pid::from_u32(pid)).is_some()
    }

    fn send_signal(&self, pid: u32, signal: Signal) -> bool {
        let raw = match signal {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        // SAFETY: kill(2) with a plain pid and a well-known signal number.
        // ESRCH (pid doesn't exist) is treated as success: kill is idempotent.
        let rc = unsafe { libc::kill(pid as i32, raw) };
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH)
    }
}

/// In-memory fake used by tests to stub process discovery rather than
/// depending on real processes.
#[derive(Default)]
pub struct FakeInspector {
    inner: Mutex<FakeInspectorState>,
}

#[derive(Default)]
struct FakeInspectorState {
    procs: HashMap<u32, OsProcess>,
    killed: Vec<(u32, Signal)>,
}

impl FakeInspector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_process(&self, pid: u32, argv: Vec<String>, ppid: Option<u32>) {
        self.inner
            .lock()
            .unwrap()
            .procs
            .insert(pid, OsProcess { pid, argv, ppid });
    }

    pub fn remove_process(&self, pid: u32) {
        self.inner.lock().unwrap().procs.remove(&pid);
    }

    pub fn killed_signals(&self) -> Vec<(u32, Signal)> {
        self.inner.lock().unwrap().killed.clone()
    }
}

impl ProcessInspector for FakeInspector {
    fn list_processes(&self) -> Vec<OsProcess> {
        self.inner.lock().unwrap().procs.values().cloned().collect()
    }

    fn pid_exists(&self, pid: u32) -> bool {
        self.inner.lock().unwrap().procs.contains_key(&pid)
    }

    fn send_signal(&self, pid: u32, signal: Signal) -> bool {
        let mut guard = self.inner.lock().unwrap();
        let existed = guard.procs.contains_key(&pid);
        guard.killed.push((pid, signal));
        if matches!(signal, Signal::Kill) {
            guard.procs.remove(&pid);
        }
        existed
    }
}
