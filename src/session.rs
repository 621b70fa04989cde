use crate::config::DfuConfig;
use crate::error::{DfuError, Phase};
use crate::events::{DfuEvent, DfuObserver, NullObserver};
use crate::transfer::ObjectTransfer;
use crate::transport::{ControlChannel, DataChannel, FirmwareSource};

use tracing::{error, info, instrument};

/// Init packet and firmware of one update
pub struct FirmwareImage<I, F> {
    /// Transferred as the command object
    pub init_packet: I,
    /// Transferred as data objects
    pub firmware: F,
}

/// One secure DFU update over a connected control/data channel pair.
///
/// The session owns both channels while it exists; `run` takes `&mut self`
/// so no two updates ever share a control point.
pub struct DfuSession<C, D> {
    control: C,
    data: D,
    config: DfuConfig,
}

impl<C: ControlChannel, D: DataChannel> DfuSession<C, D> {
    pub fn new(control: C, data: D, config: DfuConfig) -> Self {
        Self { control, data, config }
    }

    /// Give the channels back, e.g. to disconnect or to start another update.
    pub fn into_channels(self) -> (C, D) {
        (self.control, self.data)
    }

    /// Run the update to completion or to the first failure.
    ///
    /// Nothing is rolled back on failure; the target's bootloader keeps
    /// whatever it last committed.
    #[instrument(skip_all, fields(mtu = self.config.mtu))]
    pub async fn run<I: FirmwareSource, F: FirmwareSource>(
        &mut self,
        mut image: FirmwareImage<I, F>,
        observer: &dyn DfuObserver,
    ) -> Result<(), DfuError> {
        if let Err(e) = self.config.validate() {
            let err = DfuError::new(Phase::Configure, e);
            observer.on_event(&DfuEvent::Failed {
                phase: err.phase,
                message: err.to_string(),
            });
            return Err(err);
        }

        let mut transfer = match ObjectTransfer::start(&self.control, &self.data, &self.config, observer).await {
            Ok(transfer) => transfer,
            Err(err) => {
                observer.on_event(&DfuEvent::Failed {
                    phase: err.phase,
                    message: err.to_string(),
                });
                return Err(err);
            }
        };

        let result = update(&mut transfer, &mut image, self.config.exit_on_complete).await;
        match &result {
            Ok(()) => {
                transfer.finish();
                info!("update complete");
            }
            Err(err) => {
                error!(%err, state = ?transfer.state(), "update aborted");
                transfer.abort(err);
            }
        }
        result
    }
}

async fn update<C, D, I, F>(
    transfer: &mut ObjectTransfer<'_, C, D>,
    image: &mut FirmwareImage<I, F>,
    exit_on_complete: bool,
) -> Result<(), DfuError>
where
    C: ControlChannel,
    D: DataChannel,
    I: FirmwareSource,
    F: FirmwareSource,
{
    transfer.set_prn().await?;
    transfer.send_command_object(&mut image.init_packet).await?;
    transfer.send_data_objects(&mut image.firmware).await?;
    if exit_on_complete {
        transfer.exit().await?;
    }
    Ok(())
}

/// Run a complete update without observing its progress.
pub async fn run<C, D, I, F>(image: FirmwareImage<I, F>, control: C, data: D, config: DfuConfig) -> Result<(), DfuError>
where
    C: ControlChannel,
    D: DataChannel,
    I: FirmwareSource,
    F: FirmwareSource,
{
    DfuSession::new(control, data, config).run(image, &NullObserver).await
}
