//! Jail lifecycle state machine
//!
//! Dynamic-mode machine from the state-machines crate. Every transition the
//! Helm performs goes through one of these events; an event that is not valid
//! from the current state is rejected before any side effect happens.

use state_machines::state_machine;
use std::fmt;

state_machine! {
    name: JailMachine,
    dynamic: true,
    initial: Defined,
    states: [Defined, Starting, Running, Stopping, Destroying, Failed],
    events {
        start {
            transition: { from: Defined, to: Starting }
        }
        started {
            transition: { from: Starting, to: Running }
        }
        rollback {
            transition: { from: Starting, to: Defined }
        }
        stop {
            transition: { from: Running, to: Stopping }
        }
        stopped {
            transition: { from: Stopping, to: Defined }
        }
        fail {
            transition: { from: [Starting, Stopping], to: Failed }
        }
        clear {
            transition: { from: Failed, to: Defined }
        }
        destroy {
            transition: { from: Defined, to: Destroying }
        }
        restore {
            transition: { from: Destroying, to: Defined }
        }
    }
}

/// Lifecycle state of a jail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JailState {
    Defined,
    Starting,
    Running,
    Stopping,
    Destroying,
    Failed,
}

impl JailState {
    /// Parse the machine's state name
    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "Defined" => Some(JailState::Defined),
            "Starting" => Some(JailState::Starting),
            "Running" => Some(JailState::Running),
            "Stopping" => Some(JailState::Stopping),
            "Destroying" => Some(JailState::Destroying),
            "Failed" => Some(JailState::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JailState::Defined => "defined",
            JailState::Starting => "starting",
            JailState::Running => "running",
            JailState::Stopping => "stopping",
            JailState::Destroying => "destroying",
            JailState::Failed => "failed",
        }
    }

    /// States in which a runtime instance exists
    pub fn has_instance(&self) -> bool {
        matches!(self, JailState::Running | JailState::Stopping)
    }
}

impl fmt::Display for JailState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State machine wrapper for one jail
pub struct Lifecycle {
    machine: DynamicJailMachine<()>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            machine: JailMachine::new(()).into_dynamic(),
        }
    }

    /// Current state as enum
    pub fn state(&self) -> JailState {
        JailState::from_name(self.machine.current_state()).unwrap_or(JailState::Failed)
    }

    fn fire(&mut self, event: JailMachineEvent) -> Result<(), state_machines::DynamicError> {
        self.machine.handle(event)
    }

    pub fn start(&mut self) -> Result<(), state_machines::DynamicError> {
        self.fire(JailMachineEvent::Start)
    }

    pub fn started(&mut self) -> Result<(), state_machines::DynamicError> {
        self.fire(JailMachineEvent::Started)
    }

    pub fn rollback(&mut self) -> Result<(), state_machines::DynamicError> {
        self.fire(JailMachineEvent::Rollback)
    }

    pub fn stop(&mut self) -> Result<(), state_machines::DynamicError> {
        self.fire(JailMachineEvent::Stop)
    }

    pub fn stopped(&mut self) -> Result<(), state_machines::DynamicError> {
        self.fire(JailMachineEvent::Stopped)
    }

    pub fn fail(&mut self) -> Result<(), state_machines::DynamicError> {
        self.fire(JailMachineEvent::Fail)
    }

    pub fn clear(&mut self) -> Result<(), state_machines::DynamicError> {
        self.fire(JailMachineEvent::Clear)
    }

    pub fn destroy(&mut self) -> Result<(), state_machines::DynamicError> {
        self.fire(JailMachineEvent::Destroy)
    }

    pub fn restore(&mut self) -> Result<(), state_machines::DynamicError> {
        self.fire(JailMachineEvent::Restore)
    }

    /// Enter Running directly for a jail found alive at startup
    pub fn adopt(&mut self) -> Result<(), state_machines::DynamicError> {
        self.start()?;
        self.started()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let machine = JailMachine::new(()).into_dynamic();
        assert_eq!(machine.current_state(), "Defined");
    }

    #[test]
    fn test_full_lifecycle() {
        let mut lc = Lifecycle::new();
        lc.start().unwrap();
        assert_eq!(lc.state(), JailState::Starting);
        lc.started().unwrap();
        assert_eq!(lc.state(), JailState::Running);
        assert!(lc.state().has_instance());
        lc.stop().unwrap();
        assert_eq!(lc.state(), JailState::Stopping);
        lc.stopped().unwrap();
        assert_eq!(lc.state(), JailState::Defined);
    }

    #[test]
    fn test_rollback_returns_to_defined() {
        let mut lc = Lifecycle::new();
        lc.start().unwrap();
        lc.rollback().unwrap();
        assert_eq!(lc.state(), JailState::Defined);
    }

    #[test]
    fn test_fail_and_clear() {
        let mut lc = Lifecycle::new();
        lc.start().unwrap();
        lc.fail().unwrap();
        assert_eq!(lc.state(), JailState::Failed);
        assert!(lc.start().is_err());
        lc.clear().unwrap();
        assert_eq!(lc.state(), JailState::Defined);
    }

    #[test]
    fn test_destroy_only_from_defined() {
        let mut lc = Lifecycle::new();
        lc.adopt().unwrap();
        assert!(lc.destroy().is_err());
        assert_eq!(lc.state(), JailState::Running);

        let mut lc = Lifecycle::new();
        lc.destroy().unwrap();
        assert_eq!(lc.state(), JailState::Destroying);
        assert!(lc.start().is_err());
        lc.restore().unwrap();
        assert_eq!(lc.state(), JailState::Defined);
    }

    #[test]
    fn test_running_cannot_fail_directly() {
        let mut lc = Lifecycle::new();
        lc.adopt().unwrap();
        assert!(lc.fail().is_err());
    }

    #[test]
    fn test_invalid_transition() {
        let mut lc = Lifecycle::new();
        assert!(lc.stop().is_err());
        assert!(lc.clear().is_err());
    }
}
