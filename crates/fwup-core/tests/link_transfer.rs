//! End-to-end transfers against a simulated device served on its own thread.

use fwup_core::transport::{SimulatedDevice, link_pair};
use fwup_core::{
    FileSnapshotStore, FirmwareImage, Phase, SuspendReason, TransferOutcome, UpdateConfig,
    UpdateOrchestrator, UpdateStage,
};

fn config() -> UpdateConfig {
    UpdateConfig {
        block_size: 64,
        response_timeout_ms: 1000,
        ..UpdateConfig::default()
    }
}

fn firmware(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

#[test]
fn test_full_update_over_link() {
    let device = SimulatedDevice::new();
    let (transport, endpoint) = link_pair();
    let server = device.serve(endpoint);

    let data = firmware(64 * 5 + 10);
    let mut orchestrator = UpdateOrchestrator::new(transport, config());
    orchestrator
        .load_image(FirmwareImage::from_bytes(data.clone(), 64).unwrap())
        .unwrap();

    let mut stages = Vec::new();
    let outcome = orchestrator
        .transfer_and_verify(|stage, _| stages.push(stage), false)
        .unwrap();
    assert_eq!(outcome, TransferOutcome::Verified);
    assert!(stages.contains(&UpdateStage::TransmitCodeBlocks));
    assert!(stages.contains(&UpdateStage::ReadCrc));

    assert_eq!(orchestrator.apply().unwrap(), TransferOutcome::Applied);
    assert_eq!(orchestrator.session().phase(), Phase::NotActive);

    server.join().unwrap();
    assert!(device.is_applied());
    assert_eq!(device.staged_blocks(), 6);
    assert!(device.staged_block(5).unwrap().starts_with(&data[320..]));
}

#[test]
fn test_resume_on_new_link_after_drop() {
    let device = SimulatedDevice::new();
    device.disconnect_at_store(3);
    let (transport, endpoint) = link_pair();
    let first = device.serve(endpoint);

    let mut orchestrator = UpdateOrchestrator::new(transport, config());
    orchestrator
        .load_image(FirmwareImage::from_bytes(firmware(64 * 6), 64).unwrap())
        .unwrap();

    let outcome = orchestrator.transfer_and_verify(|_, _| {}, false).unwrap();
    assert_eq!(
        outcome,
        TransferOutcome::Suspended {
            phase: Phase::TransmitCodeBlocks,
            index: 3,
            reason: SuspendReason::Disconnected,
        }
    );
    first.join().unwrap();

    device.reconnect();
    device.clear_log();
    let (transport, endpoint) = link_pair();
    let second = device.serve(endpoint);
    orchestrator.on_device_reconnected(transport);

    let outcome = orchestrator.continue_from_current_state(|_, _| {}).unwrap();
    assert_eq!(outcome, TransferOutcome::Verified);
    // Picks up at block 3 without erasing again.
    assert_eq!(device.count(0x01), 0);
    assert_eq!(device.count(0x02), 3);

    assert_eq!(orchestrator.apply().unwrap(), TransferOutcome::Applied);
    second.join().unwrap();
    assert!(device.is_applied());
}

#[test]
fn test_recover_after_restart_from_file_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot_path = dir.path().join("session.toml");
    let data = firmware(64 * 4);

    let device = SimulatedDevice::new();
    device.disconnect_at_store(2);
    let (transport, endpoint) = link_pair();
    let first = device.serve(endpoint);
    {
        let mut orchestrator = UpdateOrchestrator::new(transport, config())
            .with_snapshot_store(Box::new(FileSnapshotStore::new(&snapshot_path)));
        orchestrator
            .load_image(FirmwareImage::from_bytes(data.clone(), 64).unwrap())
            .unwrap();
        let outcome = orchestrator.transfer_and_verify(|_, _| {}, false).unwrap();
        assert!(matches!(outcome, TransferOutcome::Suspended { index: 2, .. }));
    }
    first.join().unwrap();
    assert!(snapshot_path.exists());

    // A fresh process with the same image and the persisted snapshot.
    device.reconnect();
    device.clear_log();
    let (transport, endpoint) = link_pair();
    let second = device.serve(endpoint);
    let mut orchestrator = UpdateOrchestrator::new(transport, config())
        .with_snapshot_store(Box::new(FileSnapshotStore::new(&snapshot_path)));
    orchestrator
        .load_image(FirmwareImage::from_bytes(data, 64).unwrap())
        .unwrap();

    let outcome = orchestrator.transfer_and_verify(|_, _| {}, true).unwrap();
    assert_eq!(outcome, TransferOutcome::Verified);
    assert_eq!(device.count(0x01), 0);
    assert_eq!(device.count(0x02), 2);

    assert_eq!(orchestrator.apply().unwrap(), TransferOutcome::Applied);
    second.join().unwrap();
    assert!(!snapshot_path.exists());
}
