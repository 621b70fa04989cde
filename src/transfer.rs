//! Object transfer state machine.
//!
//! Drives the select, create, stream, verify and execute cycle for the
//! command object and then for every data object of the firmware image.

use crate::config::{DfuConfig, RetryPolicy};
use crate::crc::Crc32Accumulator;
use crate::error::{DfuCause, DfuError, Phase, PhaseContext};
use crate::events::{DfuEvent, DfuObserver};
use crate::protocol::{
    ObjectChecksum, ObjectInfo, ObjectType, decode_checksum, decode_error, decode_object_info, decode_response,
    encode_calculate_crc, encode_create_object, encode_execute, encode_select_object, encode_set_prn,
};
use crate::transport::{ControlChannel, DataChannel, FirmwareSource};
use crate::waiter::ResponseWaiter;

use std::io;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransferState {
    Idle,
    SettingPrn,
    SelectingCommand,
    CreatingCommand,
    StreamingCommand,
    VerifyingCommand,
    ExecutingCommand,
    SelectingData,
    CreatingData,
    StreamingData,
    VerifyingData,
    ExecutingData,
    Exiting,
    Done,
    Aborted,
}

/// End of the object that starts at `offset_start`: the next multiple of
/// `object_size`, clipped to the firmware length.
pub fn object_end(offset_start: u32, object_size: u32, firmware_len: u32) -> u32 {
    let boundary = object_size as u64 * (offset_start as u64 / object_size as u64 + 1);
    boundary.min(firmware_len as u64) as u32
}

fn image_len<S: FirmwareSource>(source: &mut S, phase: Phase) -> Result<u32, DfuError> {
    let len = source.length().phase(phase)?;
    u32::try_from(len).map_err(|_| DfuError::new(phase, DfuCause::ImageTooLarge(len)))
}

pub struct ObjectTransfer<'a, C, D> {
    control: &'a C,
    data: &'a D,
    config: &'a DfuConfig,
    observer: &'a dyn DfuObserver,
    waiter: ResponseWaiter,
    state: TransferState,
    crc: Crc32Accumulator,
    requests: u64,
}

impl<'a, C: ControlChannel, D: DataChannel> ObjectTransfer<'a, C, D> {
    /// Subscribe to the control channel; the subscription lives as long as the transfer.
    pub async fn start(
        control: &'a C,
        data: &'a D,
        config: &'a DfuConfig,
        observer: &'a dyn DfuObserver,
    ) -> Result<Self, DfuError> {
        let waiter = ResponseWaiter::subscribe(control, config.operation_timeout)
            .await
            .phase(Phase::Configure)?;
        Ok(Self {
            control,
            data,
            config,
            observer,
            waiter,
            state: TransferState::Idle,
            crc: Crc32Accumulator::new(),
            requests: 0,
        })
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    fn enter(&mut self, to: TransferState) {
        let from = self.state;
        self.state = to;
        trace!(?from, ?to, "transfer state");
        self.observer.on_event(&DfuEvent::StateChanged { from, to });
    }

    /// Write a request and wait for its response, retrying timeouts per `policy`.
    async fn request(&mut self, frame: &[u8], policy: RetryPolicy, phase: Phase) -> Result<Vec<u8>, DfuError> {
        let expected_opcode = frame.first().copied();
        let mut attempt = 1;
        loop {
            self.requests += 1;
            self.waiter.discard_stale();
            debug!(request = self.requests, ?frame, attempt, "control point request");
            self.control.write(frame).await.phase(phase)?;
            match self.waiter.await_response(expected_opcode).await {
                Ok(response) => {
                    debug!(request = self.requests, ?response, "control point response");
                    return Ok(response);
                }
                Err(DfuCause::Timeout { .. }) if attempt < policy.attempts => {
                    warn!(%phase, attempt, attempts = policy.attempts, "no response, retrying");
                    self.observer.on_event(&DfuEvent::RequestRetry {
                        phase,
                        attempt,
                        of: policy.attempts,
                    });
                    tokio::time::sleep(policy.delay).await;
                    attempt += 1;
                }
                Err(cause) => return Err(DfuError::new(phase, cause)),
            }
        }
    }

    /// Like [`Self::request`], and the response must report success.
    async fn request_ok(&mut self, frame: &[u8], policy: RetryPolicy, phase: Phase) -> Result<Vec<u8>, DfuError> {
        let response = self.request(frame, policy, phase).await?;
        let view = decode_response(&response).phase(phase)?;
        if !view.is_success() {
            let status = decode_error(&view).phase(phase)?;
            warn!(%phase, %status, "device rejected request");
            self.observer.on_event(&DfuEvent::DeviceError { phase, status });
            return Err(DfuError::new(phase, status));
        }
        Ok(response)
    }

    /// Configure packet receipt notifications, once per session.
    pub async fn set_prn(&mut self) -> Result<(), DfuError> {
        self.enter(TransferState::SettingPrn);
        let policy = self.config.request_retry;
        self.request_ok(&encode_set_prn(self.config.prn), policy, Phase::SetPrn)
            .await?;
        Ok(())
    }

    async fn select(&mut self, obj_type: ObjectType) -> Result<ObjectInfo, DfuError> {
        let phase = Phase::Select(obj_type);
        let policy = self.config.request_retry;
        let response = self.request_ok(&encode_select_object(obj_type), policy, phase).await?;
        let view = decode_response(&response).phase(phase)?;
        let info = decode_object_info(&view).phase(phase)?;
        debug!(object = %obj_type, ?info, "object selected");
        Ok(info)
    }

    async fn create(&mut self, obj_type: ObjectType, size: u32) -> Result<(), DfuError> {
        let policy = self.config.request_retry;
        self.request_ok(&encode_create_object(obj_type, size), policy, Phase::Create(obj_type))
            .await?;
        Ok(())
    }

    /// Write `[start, end)` of `source` to the data channel in MTU sized packets.
    async fn stream<S: FirmwareSource>(
        &mut self,
        source: &mut S,
        obj_type: ObjectType,
        start: u32,
        end: u32,
        total: u64,
    ) -> Result<(), DfuError> {
        let phase = Phase::Stream(obj_type);
        source.seek(start as u64).phase(phase)?;
        let mut buf = vec![0u8; self.config.packet_size()];
        let mut offset = start;
        while offset < end {
            let want = buf.len().min((end - offset) as usize);
            let read = source.read(&mut buf[..want]).phase(phase)?;
            if read == 0 {
                let eof = io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("image ended at offset {}, expected {}", offset, end),
                );
                return Err(DfuError::new(phase, eof));
            }
            if !self.config.inter_packet_delay.is_zero() {
                tokio::time::sleep(self.config.inter_packet_delay).await;
            }
            let packet = &buf[..read];
            self.data.write(packet).await.phase(phase)?;
            self.crc.update(packet);
            offset += read as u32;
            trace!(offset, len = read, crc = self.crc.value(), "packet written");
            self.observer.on_event(&DfuEvent::Progress {
                object: obj_type,
                sent: offset as u64,
                total,
            });
        }
        Ok(())
    }

    /// Compare the target's checksum against what was streamed.
    async fn verify(&mut self, obj_type: ObjectType, expected_offset: u32) -> Result<ObjectChecksum, DfuError> {
        let phase = Phase::Verify(obj_type);
        let policy = self.config.checksum_retry;
        let response = self.request_ok(&encode_calculate_crc(), policy, phase).await?;
        let view = decode_response(&response).phase(phase)?;
        let checksum = decode_checksum(&view).phase(phase)?;
        let expected_crc = self.crc.value();
        // a mismatch is not recovered from, the target's bootloader keeps the old image
        if checksum.offset != expected_offset || checksum.crc32 != expected_crc {
            return Err(DfuError::new(
                phase,
                DfuCause::ChecksumMismatch {
                    offset: checksum.offset,
                    crc: checksum.crc32,
                    expected_offset,
                    expected_crc,
                },
            ));
        }
        Ok(checksum)
    }

    async fn execute(&mut self, obj_type: ObjectType) -> Result<(), DfuError> {
        let policy = self.config.request_retry;
        self.request_ok(&encode_execute(), policy, Phase::Execute(obj_type))
            .await?;
        Ok(())
    }

    fn committed(&self, obj_type: ObjectType, checksum: ObjectChecksum) {
        info!(object = %obj_type, offset = checksum.offset, crc = checksum.crc32, "object executed");
        self.observer.on_event(&DfuEvent::ObjectCommitted {
            object: obj_type,
            offset: checksum.offset,
            crc32: checksum.crc32,
        });
    }

    /// Transfer the init packet as the command object.
    ///
    /// Skipped when the target reports a zero command object size.
    pub async fn send_command_object<S: FirmwareSource>(&mut self, init_packet: &mut S) -> Result<(), DfuError> {
        let obj_type = ObjectType::Command;
        self.enter(TransferState::SelectingCommand);
        let info = self.select(obj_type).await?;
        if info.max_size == 0 {
            info!("device takes no command object, skipping init packet");
            return Ok(());
        }
        let len = image_len(init_packet, Phase::Stream(obj_type))?;

        self.enter(TransferState::CreatingCommand);
        self.create(obj_type, len).await?;

        self.enter(TransferState::StreamingCommand);
        self.crc.reset();
        self.stream(init_packet, obj_type, 0, len, len as u64).await?;

        self.enter(TransferState::VerifyingCommand);
        let checksum = self.verify(obj_type, len).await?;

        self.enter(TransferState::ExecutingCommand);
        self.execute(obj_type).await?;
        self.committed(obj_type, checksum);
        Ok(())
    }

    /// Transfer the firmware as a sequence of data objects.
    pub async fn send_data_objects<S: FirmwareSource>(&mut self, firmware: &mut S) -> Result<(), DfuError> {
        let obj_type = ObjectType::Data;
        let len = image_len(firmware, Phase::Stream(obj_type))?;

        self.enter(TransferState::SelectingData);
        let info = self.select(obj_type).await?;
        // a fresh data object reports neither progress nor a checksum
        if info.offset != 0 || info.crc32 != 0 {
            return Err(DfuError::new(
                Phase::Select(obj_type),
                DfuCause::ResumeNotSupported { offset: info.offset },
            ));
        }
        if info.max_size == 0 {
            return Err(DfuError::new(Phase::Select(obj_type), DfuCause::ZeroObjectSize(obj_type)));
        }
        let object_size = info.max_size;
        info!(len, object_size, "uploading firmware");

        // the target's checksum spans every data object, each one continues from the last commit
        let mut committed_crc = 0;
        let mut offset_start = 0;
        while offset_start < len {
            let offset_end = object_end(offset_start, object_size, len);
            debug!(offset_start, offset_end, "data object");

            self.enter(TransferState::CreatingData);
            self.create(obj_type, offset_end - offset_start).await?;

            self.enter(TransferState::StreamingData);
            self.crc.reset_to(committed_crc);
            self.stream(firmware, obj_type, offset_start, offset_end, len as u64)
                .await?;

            self.enter(TransferState::VerifyingData);
            let checksum = self.verify(obj_type, offset_end).await?;

            self.enter(TransferState::ExecutingData);
            self.execute(obj_type).await?;
            self.committed(obj_type, checksum);

            committed_crc = checksum.crc32;
            offset_start = offset_end;
        }
        Ok(())
    }

    /// Leave secure DFU mode with the terminal (empty) frame.
    pub async fn exit(&mut self) -> Result<(), DfuError> {
        self.enter(TransferState::Exiting);
        let policy = self.config.request_retry;
        self.request_ok(&[], policy, Phase::Exit).await?;
        Ok(())
    }

    pub fn finish(&mut self) {
        self.enter(TransferState::Done);
        self.observer.on_event(&DfuEvent::Completed);
    }

    pub fn abort(&mut self, error: &DfuError) {
        self.enter(TransferState::Aborted);
        self.observer.on_event(&DfuEvent::Failed {
            phase: error.phase,
            message: error.to_string(),
        });
    }
}
