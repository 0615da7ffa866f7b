//! Per-BMC power state machine.
//!
//! Models what an IPMI client is told about the chassis:
//! ```text
//! Off ──Begin(Start)──────────► TransitioningToOn ──Succeeded──► On
//!  ▲                               │ Failed                      │
//!  │◄──────────────────────────────┘                             │
//!  │                                                             │
//!  └──Succeeded── TransitioningToOff ◄──Begin(GracefulStop)──────┤
//!                   │ Failed ──────────────────────────────────► On
//!                                     Begin(Cycle) → TransitioningToOn
//! ```
//! Both transitioning states sit under a `transitioning` superstate which
//! resolves them from an adapter poll (`Observed`).
//!
//! The machine only records state; the adapter calls are made by the session
//! that owns it. [`PowerStateMachine::begin`] decides whether a command may
//! start, [`PowerStateMachine::settle`] applies the outcome.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use statig::prelude::*;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::ipmi::completion;
use crate::vm::{AdapterError, VmPowerState};

/// Power state reported to IPMI status queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    On,
    Off,
    TransitioningToOn,
    TransitioningToOff,
}

impl PowerState {
    pub fn is_transitioning(self) -> bool {
        matches!(self, PowerState::TransitioningToOn | PowerState::TransitioningToOff)
    }

    /// The chassis power bit: a transition reports the side it started from.
    pub fn powered_on(self) -> bool {
        matches!(self, PowerState::On | PowerState::TransitioningToOff)
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerState::On => write!(f, "on"),
            PowerState::Off => write!(f, "off"),
            PowerState::TransitioningToOn => write!(f, "powering on"),
            PowerState::TransitioningToOff => write!(f, "powering off"),
        }
    }
}

impl From<VmPowerState> for PowerState {
    fn from(state: VmPowerState) -> Self {
        match state {
            VmPowerState::On => PowerState::On,
            VmPowerState::Off => PowerState::Off,
        }
    }
}

/// Chassis control commands, as decoded from IPMI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerCommand {
    On,
    Off,
    Cycle,
    Reset,
    Diag,
}

/// Adapter work a command turns into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    /// Apply the pending boot device, then start.
    Start,
    GracefulStop,
    /// Hard stop, apply the pending boot device, start.
    Cycle,
    Reset,
    Nmi,
}

/// What the session should do for an accepted command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// Nothing to do; the machine is already where the command leads.
    NoOp(PowerState),
    Run(PowerAction),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PowerError {
    #[error("a power transition is already in progress")]
    Busy,

    #[error("{command:?} is not valid while the chassis is {state}")]
    InvalidTransition {
        command: PowerCommand,
        state: PowerState,
    },

    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

impl PowerError {
    /// Nearest IPMI completion code.
    pub fn completion_code(&self) -> u8 {
        match self {
            PowerError::Busy => completion::NODE_BUSY,
            PowerError::InvalidTransition { .. } => completion::NOT_SUPPORTED_IN_PRESENT_STATE,
            PowerError::Adapter(err) => adapter_completion_code(err),
        }
    }
}

pub fn adapter_completion_code(err: &AdapterError) -> u8 {
    match err {
        AdapterError::VmNotFound(_) => completion::DATA_NOT_PRESENT,
        AdapterError::Unreachable(_) => completion::NODE_BUSY,
        AdapterError::Unsupported(_) => completion::INVALID_COMMAND,
        AdapterError::Timeout(_) => completion::TIMEOUT,
        AdapterError::Failed(_) => completion::UNSPECIFIED,
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Events dispatched to the power state machine.
#[derive(Debug, Clone)]
pub enum PowerEvent {
    /// The adapter reported the VM's real power state.
    Observed(VmPowerState),
    /// An accepted command started its adapter work.
    Begin(PowerAction),
    /// The in-flight adapter work completed.
    Succeeded,
    /// The in-flight adapter work failed.
    Failed,
}

// ---------------------------------------------------------------------------
// State machine implementation
// ---------------------------------------------------------------------------

/// Shared storage for the power state machine.
pub struct PowerMachine {
    pub identity: String,
}

#[state_machine(
    initial = "State::off()",
    state(derive(Debug, Clone, PartialEq))
)]
impl PowerMachine {
    /// Resting, powered off.
    #[state]
    fn off(&mut self, event: &PowerEvent) -> Outcome<State> {
        match event {
            PowerEvent::Observed(VmPowerState::On) => Transition(State::on()),
            PowerEvent::Begin(PowerAction::Start) => {
                Transition(State::transitioning_to_on(Instant::now()))
            }
            _ => Handled,
        }
    }

    /// Resting, powered on. Reset and NMI run without leaving this state.
    #[state]
    fn on(&mut self, event: &PowerEvent) -> Outcome<State> {
        match event {
            PowerEvent::Observed(VmPowerState::Off) => Transition(State::off()),
            PowerEvent::Begin(PowerAction::GracefulStop) => {
                Transition(State::transitioning_to_off(Instant::now()))
            }
            PowerEvent::Begin(PowerAction::Cycle) => {
                Transition(State::transitioning_to_on(Instant::now()))
            }
            _ => Handled,
        }
    }

    #[superstate]
    fn transitioning(&mut self, event: &PowerEvent) -> Outcome<State> {
        match event {
            PowerEvent::Observed(VmPowerState::On) => Transition(State::on()),
            PowerEvent::Observed(VmPowerState::Off) => Transition(State::off()),
            _ => Handled,
        }
    }

    #[state(superstate = "transitioning")]
    fn transitioning_to_on(&mut self, event: &PowerEvent, since: &Instant) -> Outcome<State> {
        let _ = since; // read by PowerStateMachine for staleness
        match event {
            PowerEvent::Succeeded => Transition(State::on()),
            PowerEvent::Failed => Transition(State::off()),
            _ => Super,
        }
    }

    #[state(superstate = "transitioning")]
    fn transitioning_to_off(&mut self, event: &PowerEvent, since: &Instant) -> Outcome<State> {
        let _ = since;
        match event {
            PowerEvent::Succeeded => Transition(State::off()),
            PowerEvent::Failed => Transition(State::on()),
            _ => Super,
        }
    }
}

// ---------------------------------------------------------------------------
// Session-facing wrapper
// ---------------------------------------------------------------------------

/// One BMC's power state. Owned by exactly one session; not shared.
pub struct PowerStateMachine {
    machine: statig::blocking::StateMachine<PowerMachine>,
    staleness: Duration,
}

impl PowerStateMachine {
    /// Start from the VM's real power state, not an assumed Off.
    pub fn new(identity: impl Into<String>, initial: VmPowerState, staleness: Duration) -> Self {
        let mut machine = PowerMachine {
            identity: identity.into(),
        }
        .state_machine();
        machine.handle(&PowerEvent::Observed(initial));
        Self { machine, staleness }
    }

    pub fn state(&self) -> PowerState {
        match self.machine.state() {
            State::Off {} => PowerState::Off,
            State::On {} => PowerState::On,
            State::TransitioningToOn { .. } => PowerState::TransitioningToOn,
            State::TransitioningToOff { .. } => PowerState::TransitioningToOff,
        }
    }

    /// How long the current transition has been running, if any.
    pub fn transition_age(&self) -> Option<Duration> {
        match self.machine.state() {
            State::TransitioningToOn { since } | State::TransitioningToOff { since } => {
                Some(since.elapsed())
            }
            _ => None,
        }
    }

    /// True when a status query should re-poll the adapter instead of
    /// trusting the cached transitional state.
    pub fn is_stale(&self) -> bool {
        self.transition_age()
            .is_some_and(|age| age >= self.staleness)
    }

    /// Decide whether `command` may run and, if it needs adapter work, enter
    /// the matching transitional state.
    pub fn begin(&mut self, command: PowerCommand) -> Result<Plan, PowerError> {
        let state = self.state();
        if state.is_transitioning() {
            return Err(PowerError::Busy);
        }

        let action = match (command, state) {
            (PowerCommand::On, PowerState::On) | (PowerCommand::Off, PowerState::Off) => {
                return Ok(Plan::NoOp(state));
            }
            (PowerCommand::On, _) => PowerAction::Start,
            (PowerCommand::Off, _) => PowerAction::GracefulStop,
            (PowerCommand::Cycle, PowerState::On) => PowerAction::Cycle,
            (PowerCommand::Reset, PowerState::On) => PowerAction::Reset,
            (PowerCommand::Diag, PowerState::On) => PowerAction::Nmi,
            (command, state) => return Err(PowerError::InvalidTransition { command, state }),
        };

        self.machine.handle(&PowerEvent::Begin(action));
        debug!(identity = %self.machine.identity, action = ?action, state = %self.state(), "Power action started");
        Ok(Plan::Run(action))
    }

    /// Apply the outcome of `action`'s adapter work. `observed` is the power
    /// state re-polled after a failure whose effect is unknown.
    pub fn settle(
        &mut self,
        action: PowerAction,
        result: &Result<(), AdapterError>,
        observed: Option<VmPowerState>,
    ) {
        let event = if result.is_ok() {
            PowerEvent::Succeeded
        } else {
            PowerEvent::Failed
        };
        self.machine.handle(&event);
        if let Some(observed) = observed {
            self.machine.handle(&PowerEvent::Observed(observed));
        }
        info!(
            identity = %self.machine.identity,
            action = ?action,
            ok = result.is_ok(),
            state = %self.state(),
            "Power action settled"
        );
    }

    /// Record an explicit adapter poll; resolves any transition.
    pub fn observe(&mut self, observed: VmPowerState) {
        self.machine.handle(&PowerEvent::Observed(observed));
    }
}

impl fmt::Debug for PowerStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PowerStateMachine")
            .field("state", &self.state())
            .field("staleness", &self.staleness)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(initial: VmPowerState) -> PowerStateMachine {
        PowerStateMachine::new("bmc-test", initial, Duration::from_secs(5))
    }

    #[test]
    fn initial_state_comes_from_vm() {
        assert_eq!(machine(VmPowerState::On).state(), PowerState::On);
        assert_eq!(machine(VmPowerState::Off).state(), PowerState::Off);
    }

    #[test]
    fn power_on_success_ends_on() {
        let mut sm = machine(VmPowerState::Off);
        assert_eq!(sm.begin(PowerCommand::On).unwrap(), Plan::Run(PowerAction::Start));
        assert_eq!(sm.state(), PowerState::TransitioningToOn);

        sm.settle(PowerAction::Start, &Ok(()), None);
        assert_eq!(sm.state(), PowerState::On);
    }

    #[test]
    fn power_on_failure_ends_off() {
        let mut sm = machine(VmPowerState::Off);
        sm.begin(PowerCommand::On).unwrap();

        sm.settle(
            PowerAction::Start,
            &Err(AdapterError::Failed("no".to_string())),
            None,
        );
        assert_eq!(sm.state(), PowerState::Off);
    }

    #[test]
    fn power_on_when_on_is_noop() {
        let mut sm = machine(VmPowerState::On);
        assert_eq!(sm.begin(PowerCommand::On).unwrap(), Plan::NoOp(PowerState::On));
        assert_eq!(sm.state(), PowerState::On);
    }

    #[test]
    fn graceful_failure_reverts_to_on() {
        let mut sm = machine(VmPowerState::On);
        assert_eq!(
            sm.begin(PowerCommand::Off).unwrap(),
            Plan::Run(PowerAction::GracefulStop)
        );
        assert_eq!(sm.state(), PowerState::TransitioningToOff);

        sm.settle(
            PowerAction::GracefulStop,
            &Err(AdapterError::Failed("acpi ignored".to_string())),
            None,
        );
        assert_eq!(sm.state(), PowerState::On);
    }

    #[test]
    fn commands_while_transitioning_are_busy() {
        let mut sm = machine(VmPowerState::Off);
        sm.begin(PowerCommand::On).unwrap();

        for command in [
            PowerCommand::On,
            PowerCommand::Off,
            PowerCommand::Reset,
            PowerCommand::Diag,
            PowerCommand::Cycle,
        ] {
            assert_eq!(sm.begin(command), Err(PowerError::Busy));
        }
    }

    #[test]
    fn reset_diag_cycle_from_off_are_invalid() {
        let mut sm = machine(VmPowerState::Off);
        for command in [PowerCommand::Reset, PowerCommand::Diag, PowerCommand::Cycle] {
            let err = sm.begin(command).unwrap_err();
            assert!(matches!(err, PowerError::InvalidTransition { .. }));
            assert_eq!(err.completion_code(), completion::NOT_SUPPORTED_IN_PRESENT_STATE);
        }
        assert_eq!(sm.state(), PowerState::Off);
    }

    #[test]
    fn reset_stays_on_and_repoll_wins_on_failure() {
        let mut sm = machine(VmPowerState::On);
        assert_eq!(sm.begin(PowerCommand::Reset).unwrap(), Plan::Run(PowerAction::Reset));
        assert_eq!(sm.state(), PowerState::On);

        sm.settle(
            PowerAction::Reset,
            &Err(AdapterError::Failed("reset failed".to_string())),
            Some(VmPowerState::Off),
        );
        assert_eq!(sm.state(), PowerState::Off);
    }

    #[test]
    fn observation_resolves_transition() {
        let mut sm = machine(VmPowerState::On);
        sm.begin(PowerCommand::Off).unwrap();
        sm.observe(VmPowerState::Off);
        assert_eq!(sm.state(), PowerState::Off);
    }

    #[test]
    fn staleness_only_applies_to_transitions() {
        let mut sm = PowerStateMachine::new("bmc-test", VmPowerState::Off, Duration::ZERO);
        assert!(!sm.is_stale());

        sm.begin(PowerCommand::On).unwrap();
        assert!(sm.is_stale());
    }

    #[test]
    fn busy_maps_to_node_busy() {
        assert_eq!(PowerError::Busy.completion_code(), completion::NODE_BUSY);
        assert_eq!(
            PowerError::from(AdapterError::VmNotFound("vm1".to_string())).completion_code(),
            completion::DATA_NOT_PRESENT
        );
    }
}
