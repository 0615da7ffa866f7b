//! vmbmc: virtual BMCs for virtual machines.
//!
//! Each configured BMC listens on its own address and answers IPMI chassis
//! commands (power on/off/cycle/reset/diag, power status, boot device) by
//! driving one VM through a hypervisor backend. A supervisor runs every BMC
//! session in its own execution unit so one misbehaving VM cannot take the
//! others down.

pub mod boot;
pub mod config;
pub mod control;
pub mod ipmi;
pub mod logging;
pub mod manage;
pub mod paths;
pub mod session;
pub mod state_machine;
pub mod store;
pub mod supervisor;
pub mod unit;
pub mod vm;
