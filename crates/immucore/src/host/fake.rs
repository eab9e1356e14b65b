//! Recording [`Host`] for tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use immucore_common::{ImmucoreError, ImmucoreResult};
use parking_lot::Mutex;

use super::{CommandOutput, CommandSpec, Host, MountEntry, MountRequest};

/// In-memory mount table plus a log of every call.
#[derive(Debug, Default)]
pub struct RecordingHost {
    mounted: Mutex<Vec<MountEntry>>,
    attempts: Mutex<Vec<MountRequest>>,
    commands: Mutex<Vec<CommandSpec>>,
    events: Mutex<Vec<String>>,
    responses: Mutex<HashMap<String, CommandOutput>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Canned output for a program name or a full command line.
    pub fn respond(&self, key: &str, output: CommandOutput) {
        self.responses.lock().insert(key.to_string(), output);
    }

    /// Make every mount of `source` fail.
    pub fn fail_mounts_of(&self, source: &str) {
        self.failing.lock().insert(source.to_string());
    }

    /// Pretend `target` is already a mountpoint.
    pub fn premount(&self, source: &str, target: &Path, fstype: &str) {
        self.mounted.lock().push(MountEntry {
            source: source.to_string(),
            target: target.to_path_buf(),
            fstype: fstype.to_string(),
        });
    }

    pub fn mounted(&self) -> Vec<MountEntry> {
        self.mounted.lock().clone()
    }

    pub fn mounted_at(&self, target: &Path) -> Option<MountEntry> {
        self.mounted.lock().iter().find(|m| m.target == target).cloned()
    }

    pub fn attempts(&self) -> Vec<MountRequest> {
        self.attempts.lock().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().iter().map(ToString::to_string).collect()
    }

    pub fn ran(&self, prefix: &str) -> bool {
        self.commands().iter().any(|c| c.starts_with(prefix))
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl Host for RecordingHost {
    fn mount(&self, request: &MountRequest) -> ImmucoreResult<()> {
        self.attempts.lock().push(request.clone());
        if self.failing.lock().contains(&request.source) {
            return Err(ImmucoreError::MountFailed {
                source_spec: request.source.clone(),
                target: request.target.clone(),
                message: "No such device".to_string(),
            });
        }
        let mut mounted = self.mounted.lock();
        if mounted.iter().any(|m| m.target == request.target) {
            return Err(ImmucoreError::AlreadyMounted {
                target: request.target.clone(),
            });
        }
        mounted.push(MountEntry {
            source: request.source.clone(),
            target: request.target.clone(),
            fstype: request.fstype.clone(),
        });
        Ok(())
    }

    fn bind(&self, source: &Path, target: &Path, recursive: bool) -> ImmucoreResult<()> {
        self.events
            .lock()
            .push(format!("bind {} {} {recursive}", source.display(), target.display()));
        self.mounted.lock().push(MountEntry {
            source: source.display().to_string(),
            target: target.to_path_buf(),
            fstype: "none".to_string(),
        });
        Ok(())
    }

    fn mounts(&self) -> ImmucoreResult<Vec<MountEntry>> {
        Ok(self.mounted())
    }

    fn make_shared(&self, target: &Path, recursive: bool) -> ImmucoreResult<()> {
        self.events
            .lock()
            .push(format!("shared {} {recursive}", target.display()));
        Ok(())
    }

    fn move_mount(&self, from: &Path, to: &Path) -> ImmucoreResult<()> {
        self.events
            .lock()
            .push(format!("move {} {}", from.display(), to.display()));
        let mut mounted = self.mounted.lock();
        for entry in mounted.iter_mut().filter(|m| m.target == from) {
            entry.target = PathBuf::from(to);
        }
        Ok(())
    }

    fn remount_readonly(&self, target: &Path) -> ImmucoreResult<()> {
        self.events
            .lock()
            .push(format!("remount-ro {}", target.display()));
        Ok(())
    }

    fn switch_root(&self, new_root: &Path) -> ImmucoreResult<()> {
        self.events
            .lock()
            .push(format!("switch-root {}", new_root.display()));
        Ok(())
    }

    fn exec(&self, program: &str, args: &[&str]) -> ImmucoreResult<()> {
        let mut line = format!("exec {program}");
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        self.events.lock().push(line);
        Ok(())
    }

    async fn run(&self, command: &CommandSpec) -> ImmucoreResult<CommandOutput> {
        self.commands.lock().push(command.clone());
        let responses = self.responses.lock();
        let output = responses
            .get(&command.to_string())
            .or_else(|| responses.get(&command.program))
            .cloned()
            .unwrap_or_else(|| CommandOutput::ok(""));
        Ok(output)
    }
}
