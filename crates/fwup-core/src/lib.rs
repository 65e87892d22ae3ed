//! fwup-core: over-the-air firmware update controller.
//!
//! Drives a firmware image into a wearable's staging area through a single
//! control point characteristic, verifies every code block by CRC, and
//! commits the image once all blocks are proven intact. Transfers survive
//! pauses, link loss and process restarts by resuming at the block they
//! stopped on.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Opcodes, response codes, command/response codec
//! - **Payload**: Firmware image chunking and CRCs
//! - **Transport**: Control point link abstraction (message-passing link, mock, simulated device)
//! - **Channel**: One-outstanding-request exchange with timeout
//! - **State**: Session phases and per-phase response handlers
//! - **Session**: Command sequencing and snapshots for one update
//! - **Events**: Observer pattern for UI decoupling
//! - **Orchestrator**: High-level driver (check, download, transfer, apply)
//!
//! # Example
//!
//! ```no_run
//! use fwup_core::{FirmwareImage, TransferOutcome, UpdateConfig, UpdateOrchestrator};
//! use fwup_core::transport::SimulatedDevice;
//!
//! let config = UpdateConfig::default();
//! let image = FirmwareImage::from_bytes(std::fs::read("band.bin")?, config.block_size)?;
//!
//! let mut orchestrator = UpdateOrchestrator::new(SimulatedDevice::new(), config);
//! orchestrator.load_image(image)?;
//! if orchestrator.transfer_and_verify(|_, _| {}, false)? == TransferOutcome::Verified {
//!     orchestrator.apply()?;
//! }
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod channel;
pub mod config;
pub mod control;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod payload;
pub mod protocol;
pub mod session;
pub mod snapshot;
pub mod state;
pub mod transport;
pub mod version;

// Re-exports for convenience
pub use channel::{ChannelError, ControlPointChannel};
pub use config::UpdateConfig;
pub use control::{ControlRequest, UpdateControl};
pub use error::{ErrorKind, FailureCause, Recovery, UpdateError};
pub use events::{
    ChannelObserver, ErrorReport, LogLevel, NullObserver, SuspendReason, TracingObserver,
    UpdateEvent, UpdateObserver, UpdateStage,
};
pub use orchestrator::{TransferOutcome, UpdateOrchestrator};
pub use payload::{CodeBlock, CodeBlockSource, FirmwareImage, ImageError};
pub use protocol::{AccessKey, ControlCommand, ControlResponse, ResponseCode};
pub use session::UpdateSession;
pub use snapshot::{FileSnapshotStore, MemorySnapshotStore, SessionSnapshot, SnapshotStore};
pub use state::{Lifecycle, Phase};
pub use transport::{ControlPointTransport, TransportError};
pub use version::{
    FirmwareVersion, LocalUpdateSource, UpdateAvailability, UpdateManifest, UpdateSource,
};
