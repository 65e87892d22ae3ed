//! In-process simulated device.
//!
//! Emulates the device side of the control point: staging area, access key
//! handling, per-block CRC and the final commit. Faults can be scripted per
//! opcode and block index to exercise the retry and recovery paths.
//!
//! The device can be used directly as a [`ControlPointTransport`] or served
//! on a background thread behind a [`LinkEndpoint`].

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::link::LinkEndpoint;
use super::traits::{ControlPointTransport, TransportError};
use crate::payload::block_crc;
use crate::protocol::constants::*;
use crate::protocol::{ControlCommand, ControlResponse, ResponseCode};

/// Scripted misbehaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    /// Answer with this code instead of handling the command.
    Respond(ResponseCode),
    /// Store the block with one bit flipped, answer success.
    CorruptStore,
    /// Handle the command but never notify.
    DropResponse,
    /// Notify with an unknown response code.
    Garbage,
    /// Link drops before the command is handled.
    Disconnect,
    /// Command is handled, link drops before the notification.
    DisconnectAfter,
}

#[derive(Debug, Clone)]
struct Fault {
    opcode: u8,
    index: Option<u16>,
    action: FaultAction,
    remaining: u32,
}

#[derive(Debug)]
struct DeviceState {
    connected: bool,
    on_charger: bool,
    supports_update: bool,
    issued_key: Option<u16>,
    access_key: Option<u16>,
    staging: BTreeMap<u16, Vec<u8>>,
    applied: bool,
    faults: Vec<Fault>,
    received: Vec<ControlCommand>,
    pending: VecDeque<Vec<u8>>,
}

/// Outcome of handling one write.
enum Reply {
    Notify(Vec<u8>),
    Silent,
    Disconnect,
    NotifyThenDisconnect(Vec<u8>),
}

/// Simulated wearable with a staging area.
///
/// Clones share the same device, so tests can inspect state after the
/// transport has been moved into an orchestrator.
#[derive(Clone)]
pub struct SimulatedDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                connected: true,
                on_charger: true,
                supports_update: true,
                issued_key: None,
                access_key: None,
                staging: BTreeMap::new(),
                applied: false,
                faults: Vec::new(),
                received: Vec::new(),
                pending: VecDeque::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        // A panic while holding the lock only happens in a failing test.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hand out this key on erase instead of echoing the requested one.
    pub fn with_issued_key(self, key: u16) -> Self {
        self.lock().issued_key = Some(key);
        self
    }

    pub fn set_on_charger(&self, on_charger: bool) {
        self.lock().on_charger = on_charger;
    }

    pub fn set_supports_update(&self, supported: bool) {
        self.lock().supports_update = supported;
    }

    /// Script `action` for the next `times` commands matching `opcode`/`index`.
    pub fn inject(&self, opcode: u8, index: Option<u16>, action: FaultAction, times: u32) {
        self.lock().faults.push(Fault {
            opcode,
            index,
            action,
            remaining: times,
        });
    }

    pub fn fail_store(&self, index: u16, code: ResponseCode, times: u32) {
        self.inject(OP_STORE_CODE_BLOCK, Some(index), FaultAction::Respond(code), times);
    }

    pub fn fail_crc_read(&self, index: u16, code: ResponseCode, times: u32) {
        self.inject(OP_READ_CODE_BLOCK_CRC, Some(index), FaultAction::Respond(code), times);
    }

    pub fn corrupt_store(&self, index: u16, times: u32) {
        self.inject(OP_STORE_CODE_BLOCK, Some(index), FaultAction::CorruptStore, times);
    }

    pub fn disconnect_at_store(&self, index: u16) {
        self.inject(OP_STORE_CODE_BLOCK, Some(index), FaultAction::Disconnect, 1);
    }

    /// Drop the link now.
    pub fn disconnect(&self) {
        let mut state = self.lock();
        state.connected = false;
        state.pending.clear();
    }

    /// Bring the link back. Staging memory and key survive.
    pub fn reconnect(&self) {
        let mut state = self.lock();
        state.connected = true;
        state.pending.clear();
    }

    pub fn is_applied(&self) -> bool {
        self.lock().applied
    }

    pub fn access_key(&self) -> Option<u16> {
        self.lock().access_key
    }

    pub fn staged_blocks(&self) -> usize {
        self.lock().staging.len()
    }

    pub fn staged_block(&self, index: u16) -> Option<Vec<u8>> {
        self.lock().staging.get(&index).cloned()
    }

    /// Every command the device has received, in order.
    pub fn received(&self) -> Vec<ControlCommand> {
        self.lock().received.clone()
    }

    /// Opcodes of every received command.
    pub fn opcodes(&self) -> Vec<u8> {
        self.lock().received.iter().map(|c| c.opcode()).collect()
    }

    pub fn count(&self, opcode: u8) -> usize {
        self.lock()
            .received
            .iter()
            .filter(|c| c.opcode() == opcode)
            .count()
    }

    pub fn clear_log(&self) {
        self.lock().received.clear();
    }

    /// Serve the device behind a link endpoint on a background thread.
    ///
    /// The thread ends when the session side goes away or the device drops
    /// the link.
    pub fn serve(&self, endpoint: LinkEndpoint) -> JoinHandle<()> {
        let device = self.clone();
        thread::spawn(move || {
            loop {
                let data = match endpoint.recv_write(Duration::from_millis(100)) {
                    Ok(Some(data)) => data,
                    Ok(None) => continue,
                    Err(_) => break,
                };
                match device.handle_write(&data) {
                    Reply::Notify(bytes) => {
                        if endpoint.notify(bytes).is_err() {
                            break;
                        }
                    }
                    Reply::Silent => {}
                    Reply::Disconnect => {
                        endpoint.disconnect();
                        break;
                    }
                    Reply::NotifyThenDisconnect(bytes) => {
                        let _ = endpoint.notify(bytes);
                        endpoint.disconnect();
                        break;
                    }
                }
            }
            debug!("Simulated device link closed");
        })
    }

    fn handle_write(&self, data: &[u8]) -> Reply {
        let mut state = self.lock();
        if !state.connected {
            return Reply::Disconnect;
        }

        let command = match ControlCommand::parse(data) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!(error = %e, "Simulated device rejected write");
                return Reply::Notify(respond(ResponseCode::InvalidOperator, 0));
            }
        };
        state.received.push(command.clone());

        match state.take_fault(&command) {
            Some(FaultAction::Respond(code)) => {
                debug!(command = %command, code = %code, "Injected response");
                Reply::Notify(respond(code, 0))
            }
            Some(FaultAction::Garbage) => Reply::Notify(vec![0xEE, 0x00, 0x00]),
            Some(FaultAction::Disconnect) => {
                info!(command = %command, "Injected disconnect");
                state.connected = false;
                Reply::Disconnect
            }
            Some(FaultAction::DropResponse) => {
                state.execute(&command, false);
                Reply::Silent
            }
            Some(FaultAction::DisconnectAfter) => {
                state.execute(&command, false);
                state.connected = false;
                Reply::Disconnect
            }
            Some(FaultAction::CorruptStore) => Reply::Notify(state.execute(&command, true)),
            None => {
                let rsp = state.execute(&command, false);
                let committed = rsp.first() == Some(&RSP_SUCCESS)
                    && matches!(command, ControlCommand::InitiateFirmwareUpdate { .. });
                if committed {
                    // Device reboots into the new image.
                    state.connected = false;
                    Reply::NotifyThenDisconnect(rsp)
                } else {
                    Reply::Notify(rsp)
                }
            }
        }
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceState {
    fn take_fault(&mut self, command: &ControlCommand) -> Option<FaultAction> {
        let opcode = command.opcode();
        let index = command.block_index();
        let fault = self.faults.iter_mut().find(|f| {
            f.remaining > 0 && f.opcode == opcode && (f.index.is_none() || f.index == index)
        })?;
        fault.remaining -= 1;
        Some(fault.action)
    }

    fn key_matches(&self, key: u16) -> bool {
        self.access_key == Some(key) && key != 0
    }

    fn execute(&mut self, command: &ControlCommand, corrupt: bool) -> Vec<u8> {
        match command {
            ControlCommand::EraseStagingArea { key } => {
                if !self.supports_update {
                    return respond(ResponseCode::NotSupported, 0);
                }
                if key.value() == 0 {
                    return respond(ResponseCode::InvalidOperator, 0);
                }
                if !self.on_charger {
                    return respond(ResponseCode::NotConnectedToCharger, 0);
                }
                let issued = self.issued_key.unwrap_or(key.value());
                self.staging.clear();
                self.applied = false;
                self.access_key = Some(issued);
                respond(ResponseCode::Success, issued)
            }
            ControlCommand::StoreCodeBlock { key, index, data } => {
                if !self.key_matches(key.value()) {
                    return respond(ResponseCode::InvalidOperator, 0);
                }
                if data.is_empty() || data.len() + 5 > MAX_WRITE_LEN {
                    return respond(ResponseCode::InvalidCodeBlock, 0);
                }
                let mut stored = data.clone();
                if corrupt && let Some(b) = stored.first_mut() {
                    *b ^= 0x01;
                }
                self.staging.insert(*index, stored);
                respond(ResponseCode::Success, *index)
            }
            ControlCommand::ReadCodeBlockCrc { index } => {
                if self.access_key.is_none() {
                    return respond(ResponseCode::InvalidOperator, 0);
                }
                match self.staging.get(index) {
                    Some(data) => respond(ResponseCode::Success, block_crc(data)),
                    None => respond(ResponseCode::InvalidCrc, 0),
                }
            }
            ControlCommand::InitiateFirmwareUpdate { key } => {
                if !self.key_matches(key.value()) {
                    return respond(ResponseCode::InvalidOperator, 0);
                }
                if !self.on_charger {
                    return respond(ResponseCode::NotConnectedToCharger, 0);
                }
                let contiguous = self
                    .staging
                    .keys()
                    .enumerate()
                    .all(|(i, &idx)| i == idx as usize);
                if self.staging.is_empty() || !contiguous {
                    return respond(ResponseCode::StagingAreaValidationFailure, 0);
                }
                self.applied = true;
                self.access_key = None;
                respond(ResponseCode::Success, 0)
            }
        }
    }
}

fn respond(code: ResponseCode, value: u16) -> Vec<u8> {
    ControlResponse::new(code, value).to_bytes().to_vec()
}

impl ControlPointTransport for SimulatedDevice {
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if !self.lock().connected {
            return Err(TransportError::Disconnected);
        }
        let reply = self.handle_write(data);
        let mut state = self.lock();
        match reply {
            Reply::Notify(bytes) => state.pending.push_back(bytes),
            Reply::NotifyThenDisconnect(bytes) => state.pending.push_back(bytes),
            Reply::Silent | Reply::Disconnect => {}
        }
        Ok(())
    }

    fn wait_notification(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut state = self.lock();
        if let Some(bytes) = state.pending.pop_front() {
            return Ok(bytes);
        }
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        Err(TransportError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        })
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    fn discard_pending(&mut self) -> usize {
        let mut state = self.lock();
        let dropped = state.pending.len();
        state.pending.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::AccessKey;

    const WAIT: Duration = Duration::from_millis(10);

    fn exchange(dev: &mut SimulatedDevice, cmd: ControlCommand) -> ControlResponse {
        dev.write(&cmd.encode(MAX_WRITE_LEN).unwrap()).unwrap();
        ControlResponse::decode(&dev.wait_notification(WAIT).unwrap()).unwrap()
    }

    fn key(raw: u16) -> AccessKey {
        AccessKey::new(raw).unwrap()
    }

    #[test]
    fn test_erase_store_crc_initiate() {
        let mut dev = SimulatedDevice::new();
        let rsp = exchange(&mut dev, ControlCommand::EraseStagingArea { key: key(0x42) });
        assert_eq!(rsp, ControlResponse::success(0x42));

        let data = vec![0x5A; 16];
        let rsp = exchange(
            &mut dev,
            ControlCommand::StoreCodeBlock {
                key: key(0x42),
                index: 0,
                data: data.clone(),
            },
        );
        assert!(rsp.code.is_success());

        let rsp = exchange(&mut dev, ControlCommand::ReadCodeBlockCrc { index: 0 });
        assert_eq!(rsp.value, block_crc(&data));

        let rsp = exchange(&mut dev, ControlCommand::InitiateFirmwareUpdate { key: key(0x42) });
        assert!(rsp.code.is_success());
        assert!(dev.is_applied());
        assert!(!dev.is_connected());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let mut dev = SimulatedDevice::new().with_issued_key(0x1111);
        exchange(&mut dev, ControlCommand::EraseStagingArea { key: key(0x42) });
        let rsp = exchange(
            &mut dev,
            ControlCommand::StoreCodeBlock {
                key: key(0x42),
                index: 0,
                data: vec![0; 8],
            },
        );
        assert_eq!(rsp.code, ResponseCode::InvalidOperator);
    }

    #[test]
    fn test_initiate_with_gap_fails_validation() {
        let mut dev = SimulatedDevice::new();
        exchange(&mut dev, ControlCommand::EraseStagingArea { key: key(7) });
        exchange(
            &mut dev,
            ControlCommand::StoreCodeBlock {
                key: key(7),
                index: 1,
                data: vec![0; 8],
            },
        );
        let rsp = exchange(&mut dev, ControlCommand::InitiateFirmwareUpdate { key: key(7) });
        assert_eq!(rsp.code, ResponseCode::StagingAreaValidationFailure);
        assert!(dev.is_connected());
    }

    #[test]
    fn test_injected_faults_are_consumed() {
        let mut dev = SimulatedDevice::new();
        dev.fail_crc_read(0, ResponseCode::InvalidCrc, 1);
        exchange(&mut dev, ControlCommand::EraseStagingArea { key: key(9) });
        exchange(
            &mut dev,
            ControlCommand::StoreCodeBlock {
                key: key(9),
                index: 0,
                data: vec![1; 8],
            },
        );
        let first = exchange(&mut dev, ControlCommand::ReadCodeBlockCrc { index: 0 });
        assert_eq!(first.code, ResponseCode::InvalidCrc);
        let second = exchange(&mut dev, ControlCommand::ReadCodeBlockCrc { index: 0 });
        assert!(second.code.is_success());
    }

    #[test]
    fn test_disconnect_keeps_staging() {
        let mut dev = SimulatedDevice::new();
        dev.disconnect_at_store(1);
        exchange(&mut dev, ControlCommand::EraseStagingArea { key: key(3) });
        exchange(
            &mut dev,
            ControlCommand::StoreCodeBlock {
                key: key(3),
                index: 0,
                data: vec![1; 8],
            },
        );
        let cmd = ControlCommand::StoreCodeBlock {
            key: key(3),
            index: 1,
            data: vec![2; 8],
        };
        dev.write(&cmd.encode(MAX_WRITE_LEN).unwrap()).unwrap();
        assert!(matches!(
            dev.wait_notification(WAIT),
            Err(TransportError::Disconnected)
        ));

        dev.reconnect();
        assert_eq!(dev.staged_blocks(), 1);
        assert_eq!(dev.access_key(), Some(3));
    }
}
