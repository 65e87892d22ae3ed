//! Event system for UI decoupling.
//!
//! Allows CLI/GUI front ends to subscribe to update events without tight
//! coupling to the core logic. All events are emitted from the thread that
//! drives the session.

use std::fmt;
use std::sync::Mutex;
use std::sync::mpsc::Sender;

use crate::error::{ErrorKind, Recovery, UpdateError};
use crate::protocol::ResponseCode;
use crate::state::Phase;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Stage reported to observers.
///
/// Mirrors the protocol phases plus the lifecycle notifications a front end
/// shows (canceled, paused, continued).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStage {
    NotActive,
    DownloadFirmware,
    EraseStagingArea,
    TransmitCodeBlocks,
    ReadCrc,
    StartFwUpdate,
    Canceled,
    Pause,
    Continue,
}

impl From<Phase> for UpdateStage {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::NotActive => UpdateStage::NotActive,
            Phase::DownloadFirmware => UpdateStage::DownloadFirmware,
            Phase::EraseStagingArea => UpdateStage::EraseStagingArea,
            Phase::TransmitCodeBlocks => UpdateStage::TransmitCodeBlocks,
            Phase::ReadCrc => UpdateStage::ReadCrc,
            Phase::StartFwUpdate => UpdateStage::StartFwUpdate,
        }
    }
}

impl fmt::Display for UpdateStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateStage::NotActive => write!(f, "Not Active"),
            UpdateStage::DownloadFirmware => write!(f, "Download Firmware"),
            UpdateStage::EraseStagingArea => write!(f, "Erase Staging Area"),
            UpdateStage::TransmitCodeBlocks => write!(f, "Transmit Code Blocks"),
            UpdateStage::ReadCrc => write!(f, "Read CRC"),
            UpdateStage::StartFwUpdate => write!(f, "Start FW Update"),
            UpdateStage::Canceled => write!(f, "Canceled"),
            UpdateStage::Pause => write!(f, "Pause"),
            UpdateStage::Continue => write!(f, "Continue"),
        }
    }
}

/// Why a session stopped issuing commands without failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendReason {
    /// Link lost; waiting for reconnection.
    Disconnected,
    /// Device refuses to continue off the charger.
    NotOnCharger,
}

impl fmt::Display for SuspendReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuspendReason::Disconnected => write!(f, "device disconnected"),
            SuspendReason::NotOnCharger => write!(f, "device not on charger"),
        }
    }
}

/// Error notification payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub recovery: Recovery,
    pub phase: Option<Phase>,
    pub block_index: Option<u16>,
    pub response: Option<ResponseCode>,
    pub message: String,
}

impl From<&UpdateError> for ErrorReport {
    fn from(err: &UpdateError) -> Self {
        let context = err.context();
        Self {
            kind: err.kind(),
            recovery: err.recovery(),
            phase: context.map(|c| c.phase),
            block_index: context.and_then(|c| c.block_index),
            response: err.response(),
            message: err.to_string(),
        }
    }
}

/// Control point packet direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Write (Host -> Device)
    Rx, // Notification (Device -> Host)
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Events emitted by the update orchestrator.
#[derive(Debug, Clone)]
pub enum UpdateEvent {
    /// Stage changed.
    StageChanged { from: UpdateStage, to: UpdateStage },
    /// Progress within the current stage.
    Progress {
        stage: UpdateStage,
        current: u64,
        total: u64,
    },
    /// A block attempt failed and is being retried.
    Retry {
        phase: Phase,
        index: u16,
        attempt: u8,
        cause: String,
    },
    /// Session waits for the device.
    Suspended {
        phase: Phase,
        index: usize,
        reason: SuspendReason,
    },
    /// Session picked up where it stopped.
    Resumed { phase: Phase, index: usize },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Update failed.
    Error(ErrorReport),
    /// Control point packet written or received.
    Packet {
        direction: PacketDirection,
        length: usize,
        data: Option<Vec<u8>>,
    },
    /// Device accepted the new firmware.
    Complete,
}

/// Observer trait for receiving update events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait UpdateObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &UpdateEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl UpdateObserver for NullObserver {
    fn on_event(&self, _event: &UpdateEvent) {}
}

/// Forwards events to a single consumer thread.
pub struct ChannelObserver {
    sender: Mutex<Sender<UpdateEvent>>,
}

impl ChannelObserver {
    pub fn new(sender: Sender<UpdateEvent>) -> Self {
        Self {
            sender: Mutex::new(sender),
        }
    }
}

impl UpdateObserver for ChannelObserver {
    fn on_event(&self, event: &UpdateEvent) {
        if let Ok(sender) = self.sender.lock() {
            // Receiver gone means nobody is listening any more.
            let _ = sender.send(event.clone());
        }
    }
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl UpdateObserver for TracingObserver {
    fn on_event(&self, event: &UpdateEvent) {
        match event {
            UpdateEvent::StageChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Stage changed");
            }
            UpdateEvent::Progress {
                stage,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::debug!(stage = %stage, progress = %format!("{}%", pct), "Progress");
            }
            UpdateEvent::Retry {
                phase,
                index,
                attempt,
                cause,
            } => {
                tracing::warn!(phase = %phase, index, attempt, "Retrying: {}", cause);
            }
            UpdateEvent::Suspended {
                phase,
                index,
                reason,
            } => {
                tracing::warn!(phase = %phase, index, reason = %reason, "Session suspended");
            }
            UpdateEvent::Resumed { phase, index } => {
                tracing::info!(phase = %phase, index, "Session resumed");
            }
            UpdateEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            UpdateEvent::Error(report) => {
                tracing::error!(
                    kind = %report.kind,
                    recovery = %report.recovery,
                    "Error: {}",
                    report.message
                );
            }
            UpdateEvent::Packet {
                direction, length, ..
            } => {
                tracing::trace!(dir = %direction, len = length, "Control point packet");
            }
            UpdateEvent::Complete => {
                tracing::info!("Firmware update complete");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_channel_observer_forwards() {
        let (tx, rx) = mpsc::channel();
        let observer = ChannelObserver::new(tx);
        observer.on_event(&UpdateEvent::Complete);
        assert!(matches!(rx.try_recv(), Ok(UpdateEvent::Complete)));
    }

    #[test]
    fn test_channel_observer_survives_dropped_receiver() {
        let (tx, rx) = mpsc::channel();
        drop(rx);
        ChannelObserver::new(tx).on_event(&UpdateEvent::Complete);
    }

    #[test]
    fn test_stage_from_phase() {
        assert_eq!(UpdateStage::from(Phase::ReadCrc), UpdateStage::ReadCrc);
        assert_eq!(UpdateStage::Pause.to_string(), "Pause");
    }
}
