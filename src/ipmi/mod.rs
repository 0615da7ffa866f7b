//! IPMI chassis command boundary.
//!
//! An external codec owns RMCP/RMCP+ framing and session handling and hands
//! us the bare request body: network function, command and data bytes. This
//! module turns that body into a closed [`ChassisRequest`] and turns results
//! back into a completion code plus response data. Anything outside the
//! chassis vocabulary below is rejected with a [`ProtocolError`]:
//!
//! ```text
//! netfn 0x00 cmd 0x01  Get Chassis Status           → PowerStatus
//! netfn 0x00 cmd 0x02  Chassis Control 0..5         → PowerOff/On/Cycle/Reset/Diag/Off
//! netfn 0x00 cmd 0x08  Set System Boot Options (5)  → SetBootDevice
//! netfn 0x00 cmd 0x09  Get System Boot Options (5)  → GetBootDevice
//! ```

use thiserror::Error;

use crate::boot::BOOT_FLAGS_LEN;

pub mod transport;

pub use transport::{ChassisTransport, UdpTransport};

pub const NETFN_CHASSIS: u8 = 0x00;

pub const CMD_GET_CHASSIS_STATUS: u8 = 0x01;
pub const CMD_CHASSIS_CONTROL: u8 = 0x02;
pub const CMD_SET_SYSTEM_BOOT_OPTIONS: u8 = 0x08;
pub const CMD_GET_SYSTEM_BOOT_OPTIONS: u8 = 0x09;

/// Boot option parameter selectors.
pub const BOOT_PARAM_SET_IN_PROGRESS: u8 = 0x00;
pub const BOOT_PARAM_INFO_ACK: u8 = 0x04;
pub const BOOT_PARAM_BOOT_FLAGS: u8 = 0x05;

/// Parameter revision reported by Get System Boot Options.
const BOOT_PARAM_VERSION: u8 = 0x01;

/// Completion codes, from the IPMI v2.0 specification (table 5-2) and the
/// boot options command (table 28-14).
pub mod completion {
    pub const OK: u8 = 0x00;
    pub const PARAMETER_NOT_SUPPORTED: u8 = 0x80;
    /// Command could not be processed; retryable.
    pub const NODE_BUSY: u8 = 0xc0;
    pub const INVALID_COMMAND: u8 = 0xc1;
    pub const TIMEOUT: u8 = 0xc3;
    pub const REQUEST_DATA_LENGTH_INVALID: u8 = 0xc7;
    pub const DATA_NOT_PRESENT: u8 = 0xcb;
    pub const INVALID_DATA_FIELD: u8 = 0xcc;
    pub const NOT_SUPPORTED_IN_PRESENT_STATE: u8 = 0xd5;
    pub const UNSPECIFIED: u8 = 0xff;
}

/// Undecoded request body as delivered by the wire codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRequest {
    pub netfn: u8,
    pub cmd: u8,
    pub data: Vec<u8>,
}

impl RawRequest {
    pub fn new(netfn: u8, cmd: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            netfn,
            cmd,
            data: data.into(),
        }
    }

    /// Parse the unframed `[netfn, cmd, data..]` layout used by the UDP
    /// transport.
    pub fn from_frame(frame: &[u8]) -> Result<Self, ProtocolError> {
        match frame {
            [netfn, cmd, data @ ..] => Ok(Self::new(*netfn, *cmd, data)),
            _ => Err(ProtocolError::Truncated(frame.len())),
        }
    }

    pub fn to_frame(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(2 + self.data.len());
        frame.push(self.netfn);
        frame.push(self.cmd);
        frame.extend_from_slice(&self.data);
        frame
    }
}

/// Completion code plus response data, before framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub completion: u8,
    pub data: Vec<u8>,
}

impl RawResponse {
    pub fn ok(data: impl Into<Vec<u8>>) -> Self {
        Self {
            completion: completion::OK,
            data: data.into(),
        }
    }

    pub fn error(completion: u8) -> Self {
        Self {
            completion,
            data: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.completion == completion::OK
    }

    /// `[completion, data..]`
    pub fn to_frame(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(1 + self.data.len());
        frame.push(self.completion);
        frame.extend_from_slice(&self.data);
        frame
    }

    pub fn from_frame(frame: &[u8]) -> Result<Self, ProtocolError> {
        match frame {
            [completion, data @ ..] => Ok(Self {
                completion: *completion,
                data: data.to_vec(),
            }),
            [] => Err(ProtocolError::Truncated(0)),
        }
    }
}

/// The closed set of requests a virtual BMC answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChassisRequest {
    PowerOn,
    /// Power down and soft shutdown both map to a graceful stop.
    PowerOff,
    PowerCycle,
    PowerReset,
    PowerDiag,
    PowerStatus,
    SetBootDevice { flags: [u8; BOOT_FLAGS_LEN] },
    GetBootDevice,
    /// Boot option parameters we accept but do not act on.
    AckBootParameter(u8),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame too short ({0} bytes)")]
    Truncated(usize),

    #[error("unsupported command netfn={netfn:#04x} cmd={cmd:#04x}")]
    UnknownCommand { netfn: u8, cmd: u8 },

    #[error("request data length {got} invalid for cmd {cmd:#04x}")]
    BadLength { cmd: u8, got: usize },

    #[error("invalid data field: {0}")]
    InvalidField(String),

    #[error("boot parameter {0} not supported")]
    ParameterNotSupported(u8),
}

impl ProtocolError {
    pub fn completion_code(&self) -> u8 {
        match self {
            ProtocolError::Truncated(_) | ProtocolError::BadLength { .. } => {
                completion::REQUEST_DATA_LENGTH_INVALID
            }
            ProtocolError::UnknownCommand { .. } => completion::INVALID_COMMAND,
            ProtocolError::InvalidField(_) => completion::INVALID_DATA_FIELD,
            ProtocolError::ParameterNotSupported(_) => completion::PARAMETER_NOT_SUPPORTED,
        }
    }
}

/// Decode a request body into a chassis request.
pub fn decode(request: &RawRequest) -> Result<ChassisRequest, ProtocolError> {
    if request.netfn != NETFN_CHASSIS {
        return Err(ProtocolError::UnknownCommand {
            netfn: request.netfn,
            cmd: request.cmd,
        });
    }

    let data = request.data.as_slice();
    match request.cmd {
        CMD_GET_CHASSIS_STATUS => Ok(ChassisRequest::PowerStatus),

        CMD_CHASSIS_CONTROL => {
            let [control, ..] = data else {
                return Err(ProtocolError::BadLength {
                    cmd: request.cmd,
                    got: data.len(),
                });
            };
            match control & 0x0f {
                0x00 | 0x05 => Ok(ChassisRequest::PowerOff),
                0x01 => Ok(ChassisRequest::PowerOn),
                0x02 => Ok(ChassisRequest::PowerCycle),
                0x03 => Ok(ChassisRequest::PowerReset),
                0x04 => Ok(ChassisRequest::PowerDiag),
                other => Err(ProtocolError::InvalidField(format!(
                    "chassis control {other:#04x}"
                ))),
            }
        }

        CMD_SET_SYSTEM_BOOT_OPTIONS => {
            let [selector, rest @ ..] = data else {
                return Err(ProtocolError::BadLength {
                    cmd: request.cmd,
                    got: data.len(),
                });
            };
            match selector & 0x7f {
                BOOT_PARAM_BOOT_FLAGS => {
                    let flags: [u8; BOOT_FLAGS_LEN] =
                        rest.try_into().map_err(|_| ProtocolError::BadLength {
                            cmd: request.cmd,
                            got: data.len(),
                        })?;
                    Ok(ChassisRequest::SetBootDevice { flags })
                }
                param @ (BOOT_PARAM_SET_IN_PROGRESS | BOOT_PARAM_INFO_ACK) => {
                    Ok(ChassisRequest::AckBootParameter(param))
                }
                other => Err(ProtocolError::ParameterNotSupported(other)),
            }
        }

        CMD_GET_SYSTEM_BOOT_OPTIONS => {
            let [selector, ..] = data else {
                return Err(ProtocolError::BadLength {
                    cmd: request.cmd,
                    got: data.len(),
                });
            };
            match selector & 0x7f {
                BOOT_PARAM_BOOT_FLAGS => Ok(ChassisRequest::GetBootDevice),
                other => Err(ProtocolError::ParameterNotSupported(other)),
            }
        }

        cmd => Err(ProtocolError::UnknownCommand {
            netfn: request.netfn,
            cmd,
        }),
    }
}

/// Get Chassis Status response data: current power state, last power event,
/// misc chassis state.
pub fn chassis_status_data(powered_on: bool) -> Vec<u8> {
    vec![u8::from(powered_on), 0x00, 0x00]
}

/// Get System Boot Options response data for the boot flags parameter.
pub fn boot_flags_data(flags: &[u8; BOOT_FLAGS_LEN]) -> Vec<u8> {
    let mut data = Vec::with_capacity(2 + BOOT_FLAGS_LEN);
    data.push(BOOT_PARAM_VERSION);
    data.push(BOOT_PARAM_BOOT_FLAGS);
    data.extend_from_slice(flags);
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control(byte: u8) -> RawRequest {
        RawRequest::new(NETFN_CHASSIS, CMD_CHASSIS_CONTROL, vec![byte])
    }

    #[test]
    fn decodes_chassis_control_verbs() {
        assert_eq!(decode(&control(0)).unwrap(), ChassisRequest::PowerOff);
        assert_eq!(decode(&control(1)).unwrap(), ChassisRequest::PowerOn);
        assert_eq!(decode(&control(2)).unwrap(), ChassisRequest::PowerCycle);
        assert_eq!(decode(&control(3)).unwrap(), ChassisRequest::PowerReset);
        assert_eq!(decode(&control(4)).unwrap(), ChassisRequest::PowerDiag);
        assert_eq!(decode(&control(5)).unwrap(), ChassisRequest::PowerOff);
    }

    #[test]
    fn rejects_unknown_control_value() {
        let err = decode(&control(9)).unwrap_err();
        assert_eq!(err.completion_code(), completion::INVALID_DATA_FIELD);
    }

    #[test]
    fn rejects_other_netfns() {
        let err = decode(&RawRequest::new(0x06, 0x01, vec![])).unwrap_err();
        assert_eq!(err.completion_code(), completion::INVALID_COMMAND);
    }

    #[test]
    fn chassis_control_without_data_is_length_error() {
        let err = decode(&RawRequest::new(NETFN_CHASSIS, CMD_CHASSIS_CONTROL, vec![])).unwrap_err();
        assert_eq!(err.completion_code(), completion::REQUEST_DATA_LENGTH_INVALID);
    }

    #[test]
    fn decodes_set_boot_flags() {
        let req = RawRequest::new(
            NETFN_CHASSIS,
            CMD_SET_SYSTEM_BOOT_OPTIONS,
            vec![0x05, 0x80, 0x14, 0x00, 0x00, 0x00],
        );
        assert_eq!(
            decode(&req).unwrap(),
            ChassisRequest::SetBootDevice {
                flags: [0x80, 0x14, 0x00, 0x00, 0x00]
            }
        );
    }

    #[test]
    fn short_boot_flags_are_rejected() {
        let req = RawRequest::new(NETFN_CHASSIS, CMD_SET_SYSTEM_BOOT_OPTIONS, vec![0x05, 0x80]);
        assert!(matches!(decode(&req), Err(ProtocolError::BadLength { .. })));
    }

    #[test]
    fn set_in_progress_is_acknowledged() {
        let req = RawRequest::new(NETFN_CHASSIS, CMD_SET_SYSTEM_BOOT_OPTIONS, vec![0x00, 0x01]);
        assert_eq!(decode(&req).unwrap(), ChassisRequest::AckBootParameter(0));
    }

    #[test]
    fn unsupported_boot_parameter() {
        let req = RawRequest::new(NETFN_CHASSIS, CMD_GET_SYSTEM_BOOT_OPTIONS, vec![0x07, 0, 0]);
        let err = decode(&req).unwrap_err();
        assert_eq!(err.completion_code(), completion::PARAMETER_NOT_SUPPORTED);
    }

    #[test]
    fn frame_layout() {
        let req = RawRequest::from_frame(&[0x00, 0x02, 0x01]).unwrap();
        assert_eq!(req, control(1));
        assert!(matches!(
            RawRequest::from_frame(&[0x00]),
            Err(ProtocolError::Truncated(1))
        ));

        let resp = RawResponse::ok(chassis_status_data(true));
        assert_eq!(resp.to_frame(), vec![0x00, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn boot_flags_response_echoes_flags() {
        let data = boot_flags_data(&[0x80, 0x08, 0, 0, 0]);
        assert_eq!(data, vec![0x01, 0x05, 0x80, 0x08, 0, 0, 0]);
    }
}
