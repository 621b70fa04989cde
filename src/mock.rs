//! Simulated secure DFU target for tests.
//!
//! Behaves like the nRF5 bootloader for the requests the engine sends: one
//! running offset/CRC per object type, objects committed by execute, and
//! scripted faults keyed by request prefix.

use crate::protocol::{OpCode, RESPONSE_MARKER, STATUS_SUCCESS};
use crate::transport::{ControlChannel, DataChannel, Notifications, TransportError};

use futures::channel::mpsc;
use futures::stream::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard};

const STATUS_OPCODE_NOT_SUPPORTED: u8 = 0x02;
const STATUS_INVALID_OBJECT: u8 = 0x05;
const STATUS_OPERATION_NOT_PERMITTED: u8 = 0x08;

#[derive(Debug, Default)]
pub struct ObjectBuffer {
    pub max_size: u32,
    /// Every byte of this type accepted since the first create
    pub received: Vec<u8>,
    committed: usize,
    object_size: usize,
}

/// A data object as seen by the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedObject {
    pub obj_type: u8,
    pub size: u32,
    pub packets: usize,
}

#[derive(Debug, Default)]
pub struct TargetState {
    pub command: ObjectBuffer,
    pub data: ObjectBuffer,
    current: Option<u8>,
    pub control_log: Vec<Vec<u8>>,
    pub data_log: Vec<Vec<u8>>,
    pub objects: Vec<CreatedObject>,
    pub prn: Option<u16>,
    pub exited: bool,
    /// Offset reported when the data object is selected
    pub resume_offset: u32,
    pub corrupt_crc: bool,
    pub fail_data_writes: bool,
    drops: Vec<(Vec<u8>, u32)>,
    overrides: Vec<(Vec<u8>, Vec<u8>)>,
}

impl TargetState {
    /// Stay silent on the next `count` requests starting with `prefix`
    pub fn drop_responses(&mut self, prefix: &[u8], count: u32) {
        self.drops.push((prefix.to_vec(), count));
    }

    /// Answer requests starting with `prefix` with a fixed frame
    pub fn respond_with(&mut self, prefix: &[u8], response: &[u8]) {
        self.overrides.push((prefix.to_vec(), response.to_vec()));
    }

    /// Reject requests starting with `prefix` with the given status bytes
    pub fn reject(&mut self, prefix: &[u8], status: &[u8]) {
        let mut response = vec![RESPONSE_MARKER, prefix[0]];
        response.extend_from_slice(status);
        self.respond_with(prefix, &response);
    }

    /// Opcodes of all control requests, `None` for the empty exit frame
    pub fn opcodes(&self) -> Vec<Option<u8>> {
        self.control_log.iter().map(|frame| frame.first().copied()).collect()
    }

    fn buffer(&mut self, obj_type: u8) -> Option<&mut ObjectBuffer> {
        match obj_type {
            0x01 => Some(&mut self.command),
            0x02 => Some(&mut self.data),
            _ => None,
        }
    }

    fn handle_control(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        self.control_log.push(frame.to_vec());

        if let Some((_, count)) = self
            .drops
            .iter_mut()
            .find(|(prefix, count)| *count > 0 && frame.starts_with(prefix))
        {
            *count -= 1;
            return None;
        }
        if let Some((_, response)) = self.overrides.iter().find(|(prefix, _)| frame.starts_with(prefix)) {
            return Some(response.clone());
        }

        let Some(&opcode) = frame.first() else {
            self.exited = true;
            return Some(vec![RESPONSE_MARKER, 0x00, STATUS_SUCCESS]);
        };
        let status = |code: u8| vec![RESPONSE_MARKER, opcode, code];
        let mut response = status(STATUS_SUCCESS);

        match OpCode::try_from(opcode) {
            Ok(OpCode::SetPrn) => {
                self.prn = Some(u16::from_le_bytes([frame[1], frame[2]]));
            }
            Ok(OpCode::SelectObject) => {
                let resume_offset = self.resume_offset;
                let is_data = frame[1] == 0x02;
                let Some(buf) = self.buffer(frame[1]) else {
                    return Some(status(STATUS_INVALID_OBJECT));
                };
                let offset = if is_data && resume_offset != 0 {
                    resume_offset
                } else {
                    buf.received.len() as u32
                };
                let crc = crc32fast::hash(&buf.received);
                response.extend_from_slice(&buf.max_size.to_le_bytes());
                response.extend_from_slice(&offset.to_le_bytes());
                response.extend_from_slice(&crc.to_le_bytes());
            }
            Ok(OpCode::CreateObject) => {
                let obj_type = frame[1];
                let size = u32::from_le_bytes([frame[2], frame[3], frame[4], frame[5]]);
                let Some(buf) = self.buffer(obj_type) else {
                    return Some(status(STATUS_INVALID_OBJECT));
                };
                if obj_type == 0x01 {
                    buf.received.clear();
                    buf.committed = 0;
                } else {
                    let committed = buf.committed;
                    buf.received.truncate(committed);
                }
                buf.object_size = size as usize;
                self.current = Some(obj_type);
                self.objects.push(CreatedObject {
                    obj_type,
                    size,
                    packets: 0,
                });
            }
            Ok(OpCode::CalculateCrc) => {
                let corrupt = self.corrupt_crc;
                let current = self.current;
                let Some(buf) = current.and_then(|t| self.buffer(t)) else {
                    return Some(status(STATUS_OPERATION_NOT_PERMITTED));
                };
                let mut crc = crc32fast::hash(&buf.received);
                if corrupt {
                    crc ^= 0xFFFF_FFFF;
                }
                response.extend_from_slice(&(buf.received.len() as u32).to_le_bytes());
                response.extend_from_slice(&crc.to_le_bytes());
            }
            Ok(OpCode::Execute) => {
                let current = self.current;
                let Some(buf) = current.and_then(|t| self.buffer(t)) else {
                    return Some(status(STATUS_OPERATION_NOT_PERMITTED));
                };
                if buf.received.len() != buf.committed + buf.object_size {
                    return Some(status(STATUS_OPERATION_NOT_PERMITTED));
                }
                buf.committed = buf.received.len();
            }
            Err(_) => return Some(status(STATUS_OPCODE_NOT_SUPPORTED)),
        }
        Some(response)
    }

    fn handle_data(&mut self, packet: &[u8]) -> Result<(), TransportError> {
        if self.fail_data_writes {
            return Err(TransportError::WriteFailed("link lost".into()));
        }
        self.data_log.push(packet.to_vec());
        if let Some(obj) = self.objects.last_mut() {
            obj.packets += 1;
        }
        let current = self.current;
        if let Some(buf) = current.and_then(|t| self.buffer(t)) {
            buf.received.extend_from_slice(packet);
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct SimTarget {
    state: Arc<Mutex<TargetState>>,
    notify: mpsc::UnboundedSender<Vec<u8>>,
    notifications: Arc<Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>>,
}

impl SimTarget {
    pub fn new(command_max_size: u32, data_max_size: u32) -> Self {
        let mut state = TargetState::default();
        state.command.max_size = command_max_size;
        state.data.max_size = data_max_size;
        let (notify, rx) = mpsc::unbounded();
        Self {
            state: Arc::new(Mutex::new(state)),
            notify,
            notifications: Arc::new(Mutex::new(Some(rx))),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, TargetState> {
        self.state.lock().unwrap()
    }

    pub fn control(&self) -> SimControl {
        SimControl(self.clone())
    }

    pub fn data(&self) -> SimData {
        SimData(self.clone())
    }
}

pub struct SimControl(SimTarget);

impl ControlChannel for SimControl {
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let response = self.0.state().handle_control(bytes);
        if let Some(response) = response {
            self.0
                .notify
                .unbounded_send(response)
                .map_err(|_| TransportError::NotificationsClosed)?;
        }
        Ok(())
    }

    async fn notifications(&self) -> Result<Notifications, TransportError> {
        let rx = self
            .0
            .notifications
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| TransportError::SubscribeFailed("already subscribed".into()))?;
        Ok(rx.boxed())
    }
}

pub struct SimData(SimTarget);

impl DataChannel for SimData {
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.0.state().handle_data(bytes)
    }
}
