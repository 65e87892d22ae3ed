//! Update orchestrator - high-level driver for the whole update.
//!
//! Owns the control point channel, the session and the persisted snapshot,
//! and runs the command loop: checkpoint for pause/cancel, issue the next
//! command, fold the response into the session, persist, report.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, instrument, warn};

use crate::channel::ControlPointChannel;
use crate::config::UpdateConfig;
use crate::control::{ControlRequest, UpdateControl};
use crate::error::{Recovery, UpdateError};
use crate::events::{
    ErrorReport, PacketDirection, SuspendReason, TracingObserver, UpdateEvent, UpdateObserver,
    UpdateStage,
};
use crate::payload::{CodeBlockSource, FirmwareImage, ImageError};
use crate::protocol::constants::STORE_HEADER_LEN;
use crate::session::UpdateSession;
use crate::snapshot::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore};
use crate::state::{HandleResult, Lifecycle, Phase, StateError};
use crate::transport::{ControlPointTransport, TransportError};
use crate::version::{
    FirmwareVersion, LocalUpdateSource, SourceError, UpdateAvailability, UpdateManifest,
    UpdateSource,
};

/// Bytes of each packet copied into trace events.
const PACKET_TRACE_LEN: usize = 32;

/// How a drive of the session ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Every block is stored and verified; ready to apply.
    Verified,
    /// Device accepted the new firmware.
    Applied,
    /// Stopped by a pause request.
    Paused { phase: Phase, index: usize },
    /// Waiting for the device.
    Suspended {
        phase: Phase,
        index: usize,
        reason: SuspendReason,
    },
    /// Stopped by a cancel request; session is back to NotActive.
    Canceled,
}

/// Where a drive stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Verified,
    Applied,
}

/// Firmware update orchestrator for one device.
pub struct UpdateOrchestrator<T: ControlPointTransport, O: UpdateObserver> {
    config: UpdateConfig,
    observer: Arc<O>,
    channel: ControlPointChannel<ObservableTransport<T, O>>,
    session: UpdateSession,
    control: UpdateControl,
    snapshots: Box<dyn SnapshotStore>,
    source: Option<Box<dyn UpdateSource>>,
    image: Option<Arc<FirmwareImage>>,
    stage: UpdateStage,
    target: Target,
}

impl<T: ControlPointTransport> UpdateOrchestrator<T, TracingObserver> {
    /// Create an orchestrator with the default tracing observer.
    pub fn new(transport: T, config: UpdateConfig) -> Self {
        Self::with_observer(transport, config, Arc::new(TracingObserver))
    }
}

impl<T: ControlPointTransport, O: UpdateObserver> UpdateOrchestrator<T, O> {
    /// Create an orchestrator with a custom observer.
    pub fn with_observer(transport: T, config: UpdateConfig, observer: Arc<O>) -> Self {
        let snapshots: Box<dyn SnapshotStore> = match &config.snapshot_path {
            Some(path) => Box::new(FileSnapshotStore::new(path)),
            None => Box::new(MemorySnapshotStore::new()),
        };
        let source = config
            .source_dir
            .as_ref()
            .map(|dir| Box::new(LocalUpdateSource::new(dir)) as Box<dyn UpdateSource>);
        let channel = Self::open_channel(transport, &config, &observer);

        Self {
            session: UpdateSession::new(config.max_retries),
            config,
            observer,
            channel,
            control: UpdateControl::new(),
            snapshots,
            source,
            image: None,
            stage: UpdateStage::NotActive,
            target: Target::Verified,
        }
    }

    pub fn with_snapshot_store(mut self, store: Box<dyn SnapshotStore>) -> Self {
        self.snapshots = store;
        self
    }

    pub fn with_source(mut self, source: Box<dyn UpdateSource>) -> Self {
        self.source = Some(source);
        self
    }

    fn open_channel(
        transport: T,
        config: &UpdateConfig,
        observer: &Arc<O>,
    ) -> ControlPointChannel<ObservableTransport<T, O>> {
        let transport = ObservableTransport {
            inner: transport,
            observer: observer.clone(),
            max_write_len: config.max_write_len,
        };
        ControlPointChannel::new(transport, config.response_timeout())
    }

    /// Handle for pausing or canceling from another thread.
    pub fn control(&self) -> UpdateControl {
        self.control.clone()
    }

    /// Last stage reported to observers.
    pub fn stage(&self) -> UpdateStage {
        self.stage
    }

    pub fn session(&self) -> &UpdateSession {
        &self.session
    }

    pub fn image(&self) -> Option<&FirmwareImage> {
        self.image.as_deref()
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.channel.transport().inner
    }

    fn emit(&self, event: UpdateEvent) {
        self.observer.on_event(&event);
    }

    fn set_stage(&mut self, to: UpdateStage) {
        if self.stage != to {
            self.emit(UpdateEvent::StageChanged {
                from: self.stage,
                to,
            });
            self.stage = to;
        }
    }

    /// Surface an error once and drop the in-memory session.
    ///
    /// The snapshot survives failures that can be resumed later.
    fn fail(&mut self, err: UpdateError) -> UpdateError {
        error!(error = %err, kind = %err.kind(), recovery = %err.recovery(), "Update failed");
        self.emit(UpdateEvent::Error(ErrorReport::from(&err)));
        if err.recovery() == Recovery::ReErase
            && let Err(e) = self.snapshots.clear()
        {
            warn!(error = %e, "Could not clear session snapshot");
        }
        self.session.reset();
        self.set_stage(UpdateStage::NotActive);
        err
    }

    /// Query the update source. No device traffic.
    #[instrument(skip(self))]
    pub fn check_update(
        &self,
        current: &FirmwareVersion,
    ) -> Result<UpdateAvailability, UpdateError> {
        let source = self.source.as_ref().ok_or(UpdateError::NoSource)?;
        Ok(source.check(current)?)
    }

    /// Fetch and chunk the image described by `manifest`.
    #[instrument(skip(self, manifest, progress), fields(version = %manifest.version))]
    pub fn download<P: FnMut(f64)>(
        &mut self,
        manifest: &UpdateManifest,
        mut progress: P,
    ) -> Result<&FirmwareImage, UpdateError> {
        if self.source.is_none() {
            return Err(UpdateError::NoSource);
        }
        self.session.begin_download()?;
        self.set_stage(UpdateStage::DownloadFirmware);

        let fetched = {
            let Some(source) = self.source.as_ref() else {
                return Err(UpdateError::NoSource);
            };
            let observer = self.observer.clone();
            let size = manifest.size as u64;
            let mut report = |fraction: f64| {
                observer.on_event(&UpdateEvent::Progress {
                    stage: UpdateStage::DownloadFirmware,
                    current: (fraction * size as f64) as u64,
                    total: size,
                });
                progress(fraction);
            };
            source.fetch(manifest, &mut report, &self.control)
        };

        let data = match fetched {
            Ok(data) => data,
            Err(SourceError::Canceled) => {
                self.finish_cancel();
                return Err(UpdateError::Canceled);
            }
            Err(e) => return Err(self.fail(e.into())),
        };

        let image = FirmwareImage::from_bytes(data, self.config.block_size)
            .and_then(|image| image.verify(manifest.size, manifest.crc32).map(|_| image));
        match image {
            Ok(image) => self.install_image(image),
            Err(e) => Err(self.fail(e.into())),
        }
    }

    /// Use an image obtained outside the update source.
    pub fn load_image(&mut self, image: FirmwareImage) -> Result<&FirmwareImage, UpdateError> {
        self.session.begin_download()?;
        self.set_stage(UpdateStage::DownloadFirmware);
        self.install_image(image)
    }

    fn install_image(&mut self, image: FirmwareImage) -> Result<&FirmwareImage, UpdateError> {
        let image = Arc::new(image);
        self.session.load(image.clone())?;
        self.image = Some(image);
        self.image.as_deref().ok_or(UpdateError::NoImage)
    }

    /// Erase, transmit and verify every block.
    ///
    /// With `recover`, the persisted snapshot is resumed instead: no erase,
    /// and transfer continues at the stored index.
    #[instrument(skip(self, progress))]
    pub fn transfer_and_verify<P: FnMut(UpdateStage, f64)>(
        &mut self,
        mut progress: P,
        recover: bool,
    ) -> Result<TransferOutcome, UpdateError> {
        let Some(image) = self.image.as_ref() else {
            return Err(UpdateError::NoImage);
        };
        if self.session.phase().is_protocol() {
            return Err(StateError::InvalidTransition {
                action: "start transfer",
                phase: self.session.phase(),
            }
            .into());
        }
        // Every store write has to fit the link before anything is erased.
        let max_write = self.channel.transport().max_write_len();
        if image.block_size() + STORE_HEADER_LEN > max_write {
            return Err(ImageError::BlockTooLarge {
                block_size: image.block_size(),
                max_write,
            }
            .into());
        }
        self.target = Target::Verified;

        if recover {
            if let Err(e) = self.recover_snapshot() {
                return Err(self.fail(e));
            }
        } else {
            let started = self
                .snapshots
                .clear()
                .map_err(UpdateError::from)
                .and_then(|_| self.session.start());
            match started {
                Ok(key) => info!(key = %key, "Starting transfer"),
                Err(e) => return Err(self.fail(e)),
            }
        }

        self.drive(&mut progress)
    }

    fn recover_snapshot(&mut self) -> Result<(), UpdateError> {
        let snapshot = self
            .snapshots
            .load()?
            .ok_or(UpdateError::NothingToResume)?;
        self.session.resume_from(&snapshot)?;
        info!(
            phase = %snapshot.phase,
            index = snapshot.current_index,
            key = %snapshot.access_key,
            "Recovering persisted session"
        );
        self.emit(UpdateEvent::Resumed {
            phase: snapshot.phase,
            index: snapshot.current_index,
        });
        Ok(())
    }

    /// Commit the verified image on the device.
    #[instrument(skip(self))]
    pub fn apply(&mut self) -> Result<TransferOutcome, UpdateError> {
        if self.session.phase() != Phase::StartFwUpdate {
            return Err(StateError::InvalidTransition {
                action: "apply",
                phase: self.session.phase(),
            }
            .into());
        }
        self.target = Target::Applied;
        self.drive(&mut |_, _| {})
    }

    /// Freeze the session where it is. No traffic until continued.
    pub fn pause(&mut self) {
        if self.session.phase().is_protocol() && self.session.lifecycle() == Lifecycle::Active {
            self.control.pause();
            self.session.pause();
            info!(phase = %self.session.phase(), index = self.session.state().current_index(), "Paused");
            self.set_stage(UpdateStage::Pause);
        }
    }

    /// Lift a pause. Position, stage and key are unchanged; no traffic.
    pub fn continue_update(&mut self) {
        self.control.resume();
        if self.session.lifecycle() == Lifecycle::Paused {
            self.session.resume();
            self.set_stage(UpdateStage::Continue);
        }
    }

    /// Drive a paused or suspended session on from where it stopped.
    #[instrument(skip(self, progress))]
    pub fn continue_from_current_state<P: FnMut(UpdateStage, f64)>(
        &mut self,
        mut progress: P,
    ) -> Result<TransferOutcome, UpdateError> {
        if !self.session.phase().is_protocol() {
            return Err(UpdateError::NothingToResume);
        }
        match self.session.lifecycle() {
            Lifecycle::Paused => self.continue_update(),
            Lifecycle::Suspended => {
                self.session.resume();
                self.emit(UpdateEvent::Resumed {
                    phase: self.session.phase(),
                    index: self.session.state().current_index(),
                });
            }
            Lifecycle::Active => {}
        }
        self.drive(&mut progress)
    }

    /// Abandon the session. Staging memory on the device is left as is.
    pub fn cancel(&mut self) {
        self.control.cancel();
        self.finish_cancel();
    }

    fn finish_cancel(&mut self) {
        info!(phase = %self.session.phase(), "Update canceled");
        self.session.reset();
        if let Err(e) = self.snapshots.clear() {
            warn!(error = %e, "Could not clear session snapshot");
        }
        self.control.clear();
        self.set_stage(UpdateStage::Canceled);
        self.set_stage(UpdateStage::NotActive);
    }

    /// Link loss reported by the connectivity layer.
    ///
    /// Suspends an active session; after the initiate went out the loss is
    /// the device rebooting into the new image.
    pub fn on_device_disconnected(&mut self) -> Result<(), UpdateError> {
        let phase = self.session.phase();
        if !phase.is_protocol() {
            return Ok(());
        }
        if phase == Phase::StartFwUpdate && self.session.state().initiate_sent() {
            self.complete();
            return Ok(());
        }
        warn!(phase = %phase, index = self.session.state().current_index(), "Device disconnected");
        self.session.suspend();
        self.persist()?;
        self.emit(UpdateEvent::Suspended {
            phase,
            index: self.session.state().current_index(),
            reason: SuspendReason::Disconnected,
        });
        Ok(())
    }

    /// Install the link of a reconnected device.
    ///
    /// A suspended session stays suspended until continued.
    pub fn on_device_reconnected(&mut self, transport: T) {
        info!(phase = %self.session.phase(), "Device reconnected");
        self.channel = Self::open_channel(transport, &self.config, &self.observer);
    }

    fn persist(&mut self) -> Result<(), UpdateError> {
        if let Some(snapshot) = self.session.snapshot() {
            self.snapshots.save(&snapshot)?;
        }
        Ok(())
    }

    fn complete(&mut self) {
        info!("Firmware update complete");
        self.session.reset();
        if let Err(e) = self.snapshots.clear() {
            warn!(error = %e, "Could not clear session snapshot");
        }
        self.emit(UpdateEvent::Complete);
        self.set_stage(UpdateStage::NotActive);
    }

    fn report_progress(&mut self, progress: &mut dyn FnMut(UpdateStage, f64)) {
        let stage = UpdateStage::from(self.session.phase());
        self.set_stage(stage);
        let (done, total) = self.session.progress();
        self.emit(UpdateEvent::Progress {
            stage,
            current: done as u64,
            total: total as u64,
        });
        if total > 0 {
            progress(stage, done as f64 / total as f64);
        }
    }

    /// Run the command loop until the target, a pause, a suspension, a
    /// cancel or an error.
    fn drive(
        &mut self,
        progress: &mut dyn FnMut(UpdateStage, f64),
    ) -> Result<TransferOutcome, UpdateError> {
        self.report_progress(progress);

        loop {
            match self.control.request() {
                ControlRequest::Cancel => {
                    self.finish_cancel();
                    return Ok(TransferOutcome::Canceled);
                }
                ControlRequest::Pause => {
                    self.session.pause();
                    self.set_stage(UpdateStage::Pause);
                    return Ok(TransferOutcome::Paused {
                        phase: self.session.phase(),
                        index: self.session.state().current_index(),
                    });
                }
                ControlRequest::Run => {}
            }

            let phase = self.session.phase();
            if self.target == Target::Verified && phase == Phase::StartFwUpdate {
                info!("All blocks verified");
                return Ok(TransferOutcome::Verified);
            }

            let command = match self.session.next_command() {
                Ok(command) => command,
                Err(e) => return Err(self.fail(e)),
            };
            let exchange = self.channel.request(&command);

            match self.session.handle(exchange, self.observer.as_ref()) {
                Ok(HandleResult::Continue) => {
                    if let Err(e) = self.persist() {
                        return Err(self.fail(e));
                    }
                    self.report_progress(progress);
                }
                Ok(HandleResult::Suspend(reason)) => {
                    let index = self.session.state().current_index();
                    warn!(phase = %phase, index, reason = %reason, "Session suspended");
                    self.session.suspend();
                    if let Err(e) = self.persist() {
                        return Err(self.fail(e));
                    }
                    self.emit(UpdateEvent::Suspended {
                        phase,
                        index,
                        reason,
                    });
                    return Ok(TransferOutcome::Suspended {
                        phase,
                        index,
                        reason,
                    });
                }
                Ok(HandleResult::Complete) => {
                    self.complete();
                    return Ok(TransferOutcome::Applied);
                }
                Err(e) => return Err(self.fail(e)),
            }
        }
    }
}

/// Transport wrapper that emits packet events.
pub struct ObservableTransport<T: ControlPointTransport, O: UpdateObserver> {
    inner: T,
    observer: Arc<O>,
    max_write_len: usize,
}

impl<T: ControlPointTransport, O: UpdateObserver> ObservableTransport<T, O> {
    pub fn inner(&self) -> &T {
        &self.inner
    }
}

impl<T: ControlPointTransport, O: UpdateObserver> ControlPointTransport
    for ObservableTransport<T, O>
{
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let res = self.inner.write(data);
        if res.is_ok() {
            self.observer.on_event(&UpdateEvent::Packet {
                direction: PacketDirection::Tx,
                length: data.len(),
                data: Some(data.iter().take(PACKET_TRACE_LEN).cloned().collect()),
            });
        }
        res
    }

    fn wait_notification(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let res = self.inner.wait_notification(timeout);
        if let Ok(data) = &res {
            self.observer.on_event(&UpdateEvent::Packet {
                direction: PacketDirection::Rx,
                length: data.len(),
                data: Some(data.clone()),
            });
        }
        res
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn max_write_len(&self) -> usize {
        self.inner.max_write_len().min(self.max_write_len)
    }

    fn discard_pending(&mut self) -> usize {
        self.inner.discard_pending()
    }
}
