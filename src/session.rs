//! One running virtual BMC.
//!
//! A [`BmcSession`] owns the listener for one [`BmcDefinition`], the power
//! state machine and the boot device translator for that BMC. A single task
//! drives it: requests are decoded and answered one at a time, and at most
//! one chassis action runs against the VM at any moment. While that action
//! is in flight the loop keeps answering status and boot-option queries and
//! rejects further chassis control with "node busy".

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::boot::{BootDeviceTranslator, BootError, PendingBoot};
use crate::control::{ControlEnvelope, ControlReply, ControlRequest};
use crate::ipmi::{
    self, ChassisRequest, ChassisTransport, ProtocolError, RawRequest, RawResponse, UdpTransport,
    completion,
};
use crate::state_machine::{
    Plan, PowerAction, PowerCommand, PowerState, PowerStateMachine, adapter_completion_code,
};
use crate::store::BmcDefinition;
use crate::vm::{AdapterError, SharedVmControl, VmControl, VmPowerState, bounded};

/// Per-session tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// A transitional state older than this is re-polled on status queries.
    pub staleness: Duration,
    /// Upper bound on every single adapter call.
    pub adapter_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            staleness: Duration::from_secs(5),
            adapter_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("boot device record: {0}")]
    Boot(#[from] BootError),

    #[error("cannot read initial power state: {0}")]
    InitialState(#[from] AdapterError),

    #[error("transport failed: {0}")]
    Transport(#[source] io::Error),
}

/// Result of one chassis action's adapter work.
#[derive(Debug)]
struct OpOutcome {
    result: Result<(), AdapterError>,
    /// Power state re-polled after a failure with an unknown effect.
    observed: Option<VmPowerState>,
}

struct InFlight {
    peer: SocketAddr,
    action: PowerAction,
    future: BoxFuture<'static, OpOutcome>,
}

pub struct BmcSession<T> {
    definition: BmcDefinition,
    transport: T,
    adapter: SharedVmControl,
    power: PowerStateMachine,
    boot: BootDeviceTranslator,
    settings: SessionSettings,
    in_flight: Option<InFlight>,
}

impl BmcSession<UdpTransport> {
    /// Bind the definition's listen address. Fails fast; never retries.
    pub async fn bind(
        definition: BmcDefinition,
        adapter: SharedVmControl,
        boot: BootDeviceTranslator,
        settings: SessionSettings,
    ) -> Result<Self, SessionError> {
        let addr = definition.listen_addr();
        let transport = UdpTransport::bind(addr)
            .await
            .map_err(|source| SessionError::Bind { addr, source })?;
        Self::with_transport(definition, transport, adapter, boot, settings).await
    }
}

impl<T: ChassisTransport> BmcSession<T> {
    /// Build a session over an already bound transport. The initial power
    /// state is read from the VM.
    pub async fn with_transport(
        definition: BmcDefinition,
        transport: T,
        adapter: SharedVmControl,
        boot: BootDeviceTranslator,
        settings: SessionSettings,
    ) -> Result<Self, SessionError> {
        let initial = bounded(settings.adapter_timeout, adapter.power_state(&definition.vm)).await?;
        let power = PowerStateMachine::new(&definition.identity, initial, settings.staleness);
        info!(
            identity = %definition.identity,
            vm = %definition.vm,
            power = %initial,
            boot = %boot.boot_device(),
            "Session ready"
        );
        Ok(Self {
            definition,
            transport,
            adapter,
            power,
            boot,
            settings,
            in_flight: None,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn power_state(&self) -> PowerState {
        self.power.state()
    }

    /// Serve requests until told to shut down or until `control` closes.
    ///
    /// On shutdown an in-flight chassis action is allowed to finish (and its
    /// requester answered) before the loop exits.
    pub async fn run(
        mut self,
        mut control: mpsc::Receiver<ControlEnvelope>,
    ) -> Result<(), SessionError> {
        let identity = self.definition.identity.clone();
        let mut control_open = true;
        let mut draining = false;
        let mut shutdown_reply: Option<oneshot::Sender<ControlReply>> = None;

        loop {
            if draining && self.in_flight.is_none() {
                break;
            }

            tokio::select! {
                received = self.transport.recv(), if !draining => {
                    let (peer, request) = match received {
                        Ok(received) => received,
                        Err(e) if is_transient(&e) => {
                            debug!(identity = %identity, error = %e, "Ignoring transient receive error");
                            continue;
                        }
                        Err(e) => return Err(SessionError::Transport(e)),
                    };
                    if let Some(response) = self.handle_request(peer, request).await {
                        self.reply(peer, &response).await;
                    }
                }

                outcome = next_outcome(&mut self.in_flight) => {
                    self.finish(outcome).await;
                }

                envelope = control.recv(), if control_open && !draining => match envelope {
                    Some((ControlRequest::Status, reply)) => {
                        let status = self.control_status().await;
                        let _ = reply.send(status);
                    }
                    Some((ControlRequest::Shutdown, reply)) => {
                        info!(identity = %identity, in_flight = self.in_flight.is_some(), "Shutdown requested");
                        draining = true;
                        shutdown_reply = Some(reply);
                    }
                    None => {
                        info!(identity = %identity, "Control channel closed, shutting down");
                        control_open = false;
                        draining = true;
                    }
                },
            }
        }

        if let Some(reply) = shutdown_reply {
            let _ = reply.send(ControlReply::ShuttingDown);
        }
        info!(identity = %identity, power = %self.power.state(), "Session stopped");
        Ok(())
    }

    /// Decode and serve one request. `None` means the answer is deferred
    /// until the chassis action it started completes.
    async fn handle_request(
        &mut self,
        peer: SocketAddr,
        request: Result<RawRequest, ProtocolError>,
    ) -> Option<RawResponse> {
        let decoded = request.and_then(|raw| ipmi::decode(&raw));
        let request = match decoded {
            Ok(request) => request,
            Err(e) => {
                warn!(identity = %self.definition.identity, peer = %peer, error = %e, "Rejected request");
                return Some(RawResponse::error(e.completion_code()));
            }
        };
        debug!(identity = %self.definition.identity, peer = %peer, request = ?request, "Request");

        match request {
            ChassisRequest::PowerStatus => Some(self.chassis_status().await),
            ChassisRequest::PowerOn => self.power_command(peer, PowerCommand::On),
            ChassisRequest::PowerOff => self.power_command(peer, PowerCommand::Off),
            ChassisRequest::PowerCycle => self.power_command(peer, PowerCommand::Cycle),
            ChassisRequest::PowerReset => self.power_command(peer, PowerCommand::Reset),
            ChassisRequest::PowerDiag => self.power_command(peer, PowerCommand::Diag),
            ChassisRequest::SetBootDevice { flags } => Some(self.set_boot_device(flags)),
            ChassisRequest::GetBootDevice => {
                Some(RawResponse::ok(ipmi::boot_flags_data(&self.boot.record().flags)))
            }
            ChassisRequest::AckBootParameter(_) => Some(RawResponse::ok(Vec::new())),
        }
    }

    fn power_command(&mut self, peer: SocketAddr, command: PowerCommand) -> Option<RawResponse> {
        // Reset and NMI keep the state On while running, so the state machine
        // alone cannot tell that an action is in flight.
        if let Some(op) = &self.in_flight {
            debug!(identity = %self.definition.identity, command = ?command, running = ?op.action, "Busy");
            return Some(RawResponse::error(completion::NODE_BUSY));
        }

        match self.power.begin(command) {
            Ok(Plan::NoOp(state)) => {
                debug!(identity = %self.definition.identity, command = ?command, state = %state, "Already there");
                Some(RawResponse::ok(Vec::new()))
            }
            Ok(Plan::Run(action)) => {
                let future = self.operation(action);
                self.in_flight = Some(InFlight {
                    peer,
                    action,
                    future,
                });
                None
            }
            Err(e) => {
                info!(identity = %self.definition.identity, command = ?command, error = %e, "Power command refused");
                Some(RawResponse::error(e.completion_code()))
            }
        }
    }

    /// Adapter work for `action`, detached from `self` so the loop can keep
    /// serving while it runs.
    fn operation(&self, action: PowerAction) -> BoxFuture<'static, OpOutcome> {
        let adapter = Arc::clone(&self.adapter);
        let vm = self.definition.vm.clone();
        let pending = self.boot.pending();
        let limit = self.settings.adapter_timeout;

        async move {
            let adapter = adapter.as_ref();
            match action {
                PowerAction::Start => OpOutcome {
                    result: power_on(adapter, &vm, pending, limit).await,
                    observed: None,
                },
                PowerAction::GracefulStop => OpOutcome {
                    result: bounded(limit, adapter.graceful_stop(&vm)).await,
                    observed: None,
                },
                PowerAction::Cycle => {
                    if let Err(e) = bounded(limit, adapter.hard_stop(&vm)).await {
                        return repolled(adapter, &vm, limit, e).await;
                    }
                    OpOutcome {
                        result: power_on(adapter, &vm, pending, limit).await,
                        observed: None,
                    }
                }
                PowerAction::Reset => match bounded(limit, adapter.hard_reset(&vm)).await {
                    Ok(()) => OpOutcome {
                        result: Ok(()),
                        observed: None,
                    },
                    Err(e) => repolled(adapter, &vm, limit, e).await,
                },
                PowerAction::Nmi => OpOutcome {
                    result: bounded(limit, adapter.send_nmi(&vm)).await,
                    observed: None,
                },
            }
        }
        .boxed()
    }

    async fn finish(&mut self, outcome: OpOutcome) {
        let Some(op) = self.in_flight.take() else {
            return;
        };
        self.power.settle(op.action, &outcome.result, outcome.observed);

        let response = match &outcome.result {
            Ok(()) => RawResponse::ok(Vec::new()),
            Err(e) => {
                warn!(
                    identity = %self.definition.identity,
                    action = ?op.action,
                    error = %e,
                    state = %self.power.state(),
                    "Power action failed"
                );
                RawResponse::error(adapter_completion_code(e))
            }
        };
        self.reply(op.peer, &response).await;
    }

    async fn chassis_status(&mut self) -> RawResponse {
        self.resolve_if_stale().await;
        RawResponse::ok(ipmi::chassis_status_data(self.power.state().powered_on()))
    }

    /// Re-poll a transition that has been running longer than the staleness
    /// threshold. The in-flight action, if any, is abandoned and its
    /// requester told it timed out.
    async fn resolve_if_stale(&mut self) {
        if !self.power.is_stale() {
            return;
        }
        let polled = bounded(
            self.settings.adapter_timeout,
            self.adapter.power_state(&self.definition.vm),
        )
        .await;
        match polled {
            Ok(observed) => {
                if let Some(op) = self.in_flight.take() {
                    warn!(
                        identity = %self.definition.identity,
                        action = ?op.action,
                        observed = %observed,
                        "Abandoning stale power action"
                    );
                    self.reply(op.peer, &RawResponse::error(completion::TIMEOUT))
                        .await;
                }
                self.power.observe(observed);
            }
            Err(e) => {
                warn!(identity = %self.definition.identity, error = %e, "Stale state re-poll failed");
            }
        }
    }

    fn set_boot_device(&mut self, flags: [u8; crate::boot::BOOT_FLAGS_LEN]) -> RawResponse {
        match self.boot.set_from_flags(flags) {
            Ok(device) => {
                info!(identity = %self.definition.identity, device = %device, "Boot device set");
                RawResponse::ok(Vec::new())
            }
            Err(BootError::UnsupportedDevice(code)) => {
                info!(identity = %self.definition.identity, code, "Unsupported boot device");
                RawResponse::error(completion::INVALID_DATA_FIELD)
            }
            Err(e @ BootError::Store(_)) => {
                warn!(identity = %self.definition.identity, error = %e, "Could not persist boot device");
                RawResponse::error(completion::UNSPECIFIED)
            }
        }
    }

    /// Status for the supervisor. Polls the VM unless an action is in flight,
    /// so a dead backend shows up as an error instead of a stale cache.
    async fn control_status(&mut self) -> ControlReply {
        self.resolve_if_stale().await;
        if self.in_flight.is_some() || self.power.state().is_transitioning() {
            return ControlReply::Status {
                power: Some(self.power.state()),
                error: None,
            };
        }

        let polled = bounded(
            self.settings.adapter_timeout,
            self.adapter.power_state(&self.definition.vm),
        )
        .await;
        match polled {
            Ok(observed) => {
                self.power.observe(observed);
                ControlReply::Status {
                    power: Some(self.power.state()),
                    error: None,
                }
            }
            Err(e) => {
                debug!(identity = %self.definition.identity, error = %e, "Status poll failed");
                ControlReply::Status {
                    power: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn reply(&mut self, peer: SocketAddr, response: &RawResponse) {
        if let Err(e) = self.transport.send(peer, response).await {
            warn!(identity = %self.definition.identity, peer = %peer, error = %e, "Failed to send response");
        }
    }
}

/// Push the pending boot device, then start. A failed push aborts the
/// power-on.
async fn power_on(
    adapter: &dyn VmControl,
    vm: &str,
    pending: PendingBoot,
    limit: Duration,
) -> Result<(), AdapterError> {
    bounded(limit, pending.apply(adapter, vm)).await?;
    bounded(limit, adapter.start(vm)).await
}

/// Failure whose effect on the VM is unknown: ask the VM where it ended up.
async fn repolled(
    adapter: &dyn VmControl,
    vm: &str,
    limit: Duration,
    error: AdapterError,
) -> OpOutcome {
    let observed = bounded(limit, adapter.power_state(vm)).await.ok();
    OpOutcome {
        result: Err(error),
        observed,
    }
}

async fn next_outcome(in_flight: &mut Option<InFlight>) -> OpOutcome {
    match in_flight {
        Some(op) => (&mut op.future).await,
        None => std::future::pending().await,
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipmi::{CMD_CHASSIS_CONTROL, CMD_GET_CHASSIS_STATUS, NETFN_CHASSIS};
    use crate::store::Credentials;
    use crate::vm::memory::Op;
    use crate::vm::{BootDevice, MemoryAdapter};
    use tokio::net::UdpSocket;
    use tokio::task::JoinHandle;

    struct Harness {
        server: SocketAddr,
        client: UdpSocket,
        control: mpsc::Sender<ControlEnvelope>,
        task: JoinHandle<Result<(), SessionError>>,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        async fn call(&self, frame: &[u8]) -> Vec<u8> {
            self.client.send_to(frame, self.server).await.unwrap();
            self.recv().await
        }

        async fn recv(&self) -> Vec<u8> {
            let mut buf = [0u8; 64];
            let (len, _) = tokio::time::timeout(Duration::from_secs(5), self.client.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            buf[..len].to_vec()
        }

        async fn status(&self) -> ControlReply {
            let (tx, rx) = oneshot::channel();
            self.control.send((ControlRequest::Status, tx)).await.unwrap();
            rx.await.unwrap()
        }
    }

    fn definition() -> BmcDefinition {
        BmcDefinition {
            identity: "bmc-a".to_string(),
            vm: "vm1".to_string(),
            address: "127.0.0.1".parse().unwrap(),
            port: 0,
            credentials: Credentials {
                username: "admin".to_string(),
                password: "password".to_string(),
            },
        }
    }

    async fn start(adapter: &MemoryAdapter, settings: SessionSettings) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let boot = BootDeviceTranslator::load(dir.path().join("boot.toml")).unwrap();
        let shared: SharedVmControl = Arc::new(adapter.clone());
        let session = BmcSession::bind(definition(), shared, boot, settings)
            .await
            .unwrap();
        let server = session.local_addr().unwrap();
        let (control, rx) = mpsc::channel(4);
        let task = tokio::spawn(session.run(rx));
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        Harness {
            server,
            client,
            control,
            task,
            _dir: dir,
        }
    }

    fn control(verb: u8) -> Vec<u8> {
        vec![NETFN_CHASSIS, CMD_CHASSIS_CONTROL, verb]
    }

    const STATUS: [u8; 2] = [NETFN_CHASSIS, CMD_GET_CHASSIS_STATUS];

    #[tokio::test]
    async fn initial_state_is_read_from_vm() {
        let adapter = MemoryAdapter::new();
        adapter.add_vm("vm1", VmPowerState::On);
        let h = start(&adapter, SessionSettings::default()).await;

        assert_eq!(h.call(&STATUS).await, vec![0x00, 0x01, 0x00, 0x00]);
    }

    #[tokio::test]
    async fn power_on_answers_after_start() {
        let adapter = MemoryAdapter::new();
        adapter.add_vm("vm1", VmPowerState::Off);
        let h = start(&adapter, SessionSettings::default()).await;

        assert_eq!(h.call(&control(0x01)).await, vec![0x00]);
        assert_eq!(adapter.vm_power("vm1"), Some(VmPowerState::On));
        assert_eq!(h.call(&STATUS).await, vec![0x00, 0x01, 0x00, 0x00]);
    }

    #[tokio::test]
    async fn power_on_failure_reports_code_and_off() {
        let adapter = MemoryAdapter::new();
        adapter.add_vm("vm1", VmPowerState::Off);
        adapter.fail(Op::Start, AdapterError::Failed("boom".to_string()));
        let h = start(&adapter, SessionSettings::default()).await;

        assert_eq!(h.call(&control(0x01)).await, vec![completion::UNSPECIFIED]);
        assert_eq!(h.call(&STATUS).await, vec![0x00, 0x00, 0x00, 0x00]);
    }

    #[tokio::test]
    async fn second_power_on_while_in_flight_is_busy() {
        let adapter = MemoryAdapter::new();
        adapter.add_vm("vm1", VmPowerState::Off);
        let h = start(&adapter, SessionSettings::default()).await;
        adapter.set_latency(Duration::from_millis(300));

        h.client.send_to(&control(0x01), h.server).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.client.send_to(&control(0x01), h.server).await.unwrap();

        assert_eq!(h.recv().await, vec![completion::NODE_BUSY]);
        assert_eq!(h.recv().await, vec![0x00]);
        assert_eq!(adapter.calls(Op::Start), 1);
    }

    #[tokio::test]
    async fn reset_from_off_is_refused_without_adapter_calls() {
        let adapter = MemoryAdapter::new();
        adapter.add_vm("vm1", VmPowerState::Off);
        let h = start(&adapter, SessionSettings::default()).await;
        let before = adapter.mutating_calls();

        assert_eq!(
            h.call(&control(0x03)).await,
            vec![completion::NOT_SUPPORTED_IN_PRESENT_STATE]
        );
        assert_eq!(adapter.mutating_calls(), before);
    }

    const STATUS_ON: [u8; 4] = [0x00, 0x01, 0x00, 0x00];
    const STATUS_OFF: [u8; 4] = [0x00, 0x00, 0x00, 0x00];

    #[tokio::test]
    async fn graceful_off_from_on_ends_off() {
        let adapter = MemoryAdapter::new();
        adapter.add_vm("vm1", VmPowerState::On);
        let h = start(&adapter, SessionSettings::default()).await;

        assert_eq!(h.call(&control(0x00)).await, vec![0x00]);
        assert_eq!(adapter.calls(Op::GracefulStop), 1);
        assert_eq!(adapter.calls(Op::HardStop), 0);
        assert_eq!(h.call(&STATUS).await, STATUS_OFF.to_vec());
    }

    #[tokio::test]
    async fn power_cycle_stops_then_starts() {
        let adapter = MemoryAdapter::new();
        adapter.add_vm("vm1", VmPowerState::On);
        let h = start(&adapter, SessionSettings::default()).await;

        assert_eq!(h.call(&control(0x02)).await, vec![0x00]);
        assert_eq!(adapter.calls(Op::HardStop), 1);
        assert_eq!(adapter.calls(Op::Start), 1);
        assert_eq!(adapter.vm_power("vm1"), Some(VmPowerState::On));
        assert_eq!(h.call(&STATUS).await, STATUS_ON.to_vec());
    }

    #[tokio::test]
    async fn power_cycle_stop_failure_requeries_state() {
        let adapter = MemoryAdapter::new();
        adapter.add_vm("vm1", VmPowerState::On);
        adapter.fail(Op::HardStop, AdapterError::Failed("stuck".to_string()));
        let h = start(&adapter, SessionSettings::default()).await;

        assert_eq!(h.call(&control(0x02)).await, vec![completion::UNSPECIFIED]);
        assert_eq!(adapter.calls(Op::Start), 0);
        // Initial read plus the re-query after the failed stop.
        assert_eq!(adapter.calls(Op::PowerState), 2);
        assert_eq!(h.call(&STATUS).await, STATUS_ON.to_vec());
    }

    #[tokio::test]
    async fn diag_interrupt_sends_one_nmi() {
        let adapter = MemoryAdapter::new();
        adapter.add_vm("vm1", VmPowerState::On);
        let h = start(&adapter, SessionSettings::default()).await;

        assert_eq!(h.call(&control(0x04)).await, vec![0x00]);
        assert_eq!(adapter.calls(Op::SendNmi), 1);
        assert_eq!(adapter.vm_power("vm1"), Some(VmPowerState::On));
        assert_eq!(h.call(&STATUS).await, STATUS_ON.to_vec());
    }

    #[tokio::test]
    async fn reset_from_on_stays_on() {
        let adapter = MemoryAdapter::new();
        adapter.add_vm("vm1", VmPowerState::On);
        let h = start(&adapter, SessionSettings::default()).await;

        assert_eq!(h.call(&control(0x03)).await, vec![0x00]);
        assert_eq!(adapter.calls(Op::HardReset), 1);
        assert_eq!(h.call(&STATUS).await, STATUS_ON.to_vec());
    }

    #[tokio::test]
    async fn failed_reset_takes_polled_state() {
        let adapter = MemoryAdapter::new();
        adapter.add_vm("vm1", VmPowerState::On);
        let h = start(&adapter, SessionSettings::default()).await;

        // Powered off behind the BMC's back; the reset itself then fails.
        adapter.set_vm_power("vm1", VmPowerState::Off);
        assert_eq!(h.call(&control(0x03)).await, vec![completion::UNSPECIFIED]);
        assert_eq!(adapter.calls(Op::PowerState), 2);
        assert_eq!(h.call(&STATUS).await, STATUS_OFF.to_vec());
    }

    #[tokio::test]
    async fn failed_reset_on_running_vm_stays_on() {
        let adapter = MemoryAdapter::new();
        adapter.add_vm("vm1", VmPowerState::On);
        adapter.fail(Op::HardReset, AdapterError::Timeout(Duration::from_secs(1)));
        let h = start(&adapter, SessionSettings::default()).await;

        assert_eq!(h.call(&control(0x03)).await, vec![completion::TIMEOUT]);
        assert_eq!(adapter.calls(Op::PowerState), 2);
        assert_eq!(h.call(&STATUS).await, STATUS_ON.to_vec());
    }

    #[tokio::test]
    async fn malformed_request_leaves_state_alone() {
        let adapter = MemoryAdapter::new();
        adapter.add_vm("vm1", VmPowerState::On);
        let h = start(&adapter, SessionSettings::default()).await;

        assert_eq!(h.call(&[0x00]).await, vec![completion::REQUEST_DATA_LENGTH_INVALID]);
        assert_eq!(h.call(&[0x06, 0x01]).await, vec![completion::INVALID_COMMAND]);
        assert_eq!(h.call(&STATUS).await, vec![0x00, 0x01, 0x00, 0x00]);
        assert_eq!(adapter.mutating_calls(), 0);
    }

    #[tokio::test]
    async fn boot_device_applied_before_power_on() {
        let adapter = MemoryAdapter::new();
        adapter.add_vm("vm1", VmPowerState::Off);
        let h = start(&adapter, SessionSettings::default()).await;

        let set = [NETFN_CHASSIS, 0x08, 0x05, 0x80, 0x04, 0x00, 0x00, 0x00];
        assert_eq!(h.call(&set).await, vec![0x00]);
        assert_eq!(adapter.calls(Op::SetBootDevice), 0);

        let get = [NETFN_CHASSIS, 0x09, 0x05, 0x00, 0x00];
        assert_eq!(
            h.call(&get).await,
            vec![0x00, 0x01, 0x05, 0x80, 0x04, 0x00, 0x00, 0x00]
        );

        assert_eq!(h.call(&control(0x01)).await, vec![0x00]);
        assert_eq!(adapter.vm_boot("vm1"), Some(BootDevice::Network));
    }

    #[tokio::test]
    async fn unsupported_boot_device_is_invalid_field() {
        let adapter = MemoryAdapter::new();
        adapter.add_vm("vm1", VmPowerState::Off);
        let h = start(&adapter, SessionSettings::default()).await;

        let set = [NETFN_CHASSIS, 0x08, 0x05, 0x80, 0x18, 0x00, 0x00, 0x00];
        assert_eq!(h.call(&set).await, vec![completion::INVALID_DATA_FIELD]);
    }

    #[tokio::test]
    async fn stale_transition_is_resolved_by_status() {
        let adapter = MemoryAdapter::new();
        adapter.add_vm("vm1", VmPowerState::On);
        let settings = SessionSettings {
            staleness: Duration::from_millis(100),
            adapter_timeout: Duration::from_secs(30),
        };
        let h = start(&adapter, settings).await;
        adapter.set_latency(Duration::from_secs(10));

        h.client.send_to(&control(0x00), h.server).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // The guest ignored the request; the re-poll sees it still running.
        adapter.set_latency(Duration::ZERO);
        h.client.send_to(&STATUS, h.server).await.unwrap();
        assert_eq!(h.recv().await, vec![completion::TIMEOUT]);
        assert_eq!(h.recv().await, vec![0x00, 0x01, 0x00, 0x00]);
    }

    #[tokio::test]
    async fn control_status_reports_adapter_errors() {
        let adapter = MemoryAdapter::new();
        adapter.add_vm("vm1", VmPowerState::On);
        let h = start(&adapter, SessionSettings::default()).await;

        assert_eq!(
            h.status().await,
            ControlReply::Status {
                power: Some(PowerState::On),
                error: None
            }
        );

        adapter.set_unreachable(true);
        let ControlReply::Status { power, error } = h.status().await else {
            panic!("expected status reply");
        };
        assert_eq!(power, None);
        assert!(error.is_some());
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_action() {
        let adapter = MemoryAdapter::new();
        adapter.add_vm("vm1", VmPowerState::Off);
        let h = start(&adapter, SessionSettings::default()).await;
        adapter.set_latency(Duration::from_millis(200));

        h.client.send_to(&control(0x01), h.server).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (tx, rx) = oneshot::channel();
        h.control.send((ControlRequest::Shutdown, tx)).await.unwrap();
        assert_eq!(rx.await.unwrap(), ControlReply::ShuttingDown);

        assert_eq!(h.recv().await, vec![0x00]);
        assert_eq!(adapter.vm_power("vm1"), Some(VmPowerState::On));
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn closing_control_channel_stops_session() {
        let adapter = MemoryAdapter::new();
        adapter.add_vm("vm1", VmPowerState::Off);
        let h = start(&adapter, SessionSettings::default()).await;

        drop(h.control);
        tokio::time::timeout(Duration::from_secs(5), h.task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn missing_vm_fails_session_start() {
        let adapter = MemoryAdapter::new();
        let dir = tempfile::tempdir().unwrap();
        let boot = BootDeviceTranslator::load(dir.path().join("boot.toml")).unwrap();
        let result = BmcSession::bind(
            definition(),
            Arc::new(adapter),
            boot,
            SessionSettings::default(),
        )
        .await;
        assert!(matches!(
            result,
            Err(SessionError::InitialState(AdapterError::VmNotFound(_)))
        ));
    }
}
