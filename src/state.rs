// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Per-handle lifecycle gate.

use crate::error::{FastpathError, Result};
use std::fmt;
use tracing::debug;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum DeviceState {
    #[default]
    Init,
    AcquiredDevice,
    AcquiredHardware,
    Started,
    Stopped,
}

impl DeviceState {
    /// Legal successor states.
    pub fn successors(self) -> &'static [DeviceState] {
        use DeviceState::*;
        match self {
            Init => &[AcquiredDevice],
            AcquiredDevice => &[Init, AcquiredHardware, Started],
            AcquiredHardware => &[AcquiredDevice, Started],
            Started => &[Stopped],
            Stopped => &[Started, AcquiredDevice],
        }
    }

    pub fn can_transition(self, target: DeviceState) -> bool {
        self.successors().contains(&target)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            DeviceState::Init => "INIT",
            DeviceState::AcquiredDevice => "ACQUIRED_DEVICE",
            DeviceState::AcquiredHardware => "ACQUIRED_HARDWARE",
            DeviceState::Started => "STARTED",
            DeviceState::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// Client commands gated by the state machine.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    AcquireDevice,
    AcquireHardware,
    ReleaseHardware,
    Start,
    Stop,
    ReleaseDevice,
    Configure,
    Flush,
    Enqueue,
    Dequeue,
}

impl Command {
    /// State a transition command moves to, `None` for commands that leave
    /// the state alone.
    pub fn target(self) -> Option<DeviceState> {
        match self {
            Command::AcquireDevice => Some(DeviceState::AcquiredDevice),
            Command::AcquireHardware => Some(DeviceState::AcquiredHardware),
            Command::ReleaseHardware => Some(DeviceState::AcquiredDevice),
            Command::Start => Some(DeviceState::Started),
            Command::Stop => Some(DeviceState::Stopped),
            Command::ReleaseDevice => Some(DeviceState::Init),
            Command::Configure | Command::Flush | Command::Enqueue | Command::Dequeue => None,
        }
    }
}

/// Check-then-act state holder. A failed [`check`](Self::check) leaves the
/// state untouched and the command must not be attempted. The new state is
/// only recorded with [`commit`](Self::commit) once the command succeeded.
#[derive(Debug, Default)]
pub struct DeviceStateMachine {
    state: DeviceState,
}

impl DeviceStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Returns the target state of `cmd` if it may run now.
    ///
    /// # Errors
    ///
    /// `PermissionDenied` when the transition is not in the table, or when a
    /// non-transition command is issued in `INIT`.
    pub fn check(&self, cmd: Command) -> Result<Option<DeviceState>> {
        match cmd.target() {
            Some(target) if self.state.can_transition(target) => Ok(Some(target)),
            Some(target) => {
                debug!("{:?} rejected: {} -> {}", cmd, self.state, target);
                Err(FastpathError::PermissionDenied)
            }
            None if self.state == DeviceState::Init => {
                debug!("{:?} rejected in {}", cmd, self.state);
                Err(FastpathError::PermissionDenied)
            }
            None => Ok(None),
        }
    }

    pub fn commit(&mut self, target: DeviceState) {
        debug!("state {} -> {}", self.state, target);
        self.state = target;
    }

    /// Forces the state back to `INIT` for teardown paths that already
    /// released every resource.
    pub fn reset(&mut self) {
        self.state = DeviceState::Init;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table() {
        use DeviceState::*;
        let all = [Init, AcquiredDevice, AcquiredHardware, Started, Stopped];
        let allowed = [
            (Init, AcquiredDevice),
            (AcquiredDevice, Init),
            (AcquiredDevice, AcquiredHardware),
            (AcquiredDevice, Started),
            (AcquiredHardware, AcquiredDevice),
            (AcquiredHardware, Started),
            (Started, Stopped),
            (Stopped, Started),
            (Stopped, AcquiredDevice),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn non_transition_commands_need_a_device() {
        let mut dcsm = DeviceStateMachine::new();
        assert_eq!(
            dcsm.check(Command::Configure),
            Err(FastpathError::PermissionDenied)
        );
        dcsm.commit(DeviceState::AcquiredDevice);
        assert_eq!(dcsm.check(Command::Configure), Ok(None));
    }
}
