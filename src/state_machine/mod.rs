//! statig state machines.

pub mod power_sm;

pub use power_sm::{
    Plan, PowerAction, PowerCommand, PowerError, PowerState, PowerStateMachine,
    adapter_completion_code,
};
