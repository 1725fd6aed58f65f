use printer_link::config::QueueConfig;
use printer_link::probes::{self, PrinterType, ProbeError};
use printer_link::serial::mock::{MockFirmware, mock_pair, spawn_simulator};
use printer_link::serial::{OutputRouter, SerialQueue};
use printer_link::shutdown::Shutdown;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);

fn queue() -> (SerialQueue, MockFirmware, Shutdown) {
    let (transport, firmware) = mock_pair();
    let config = QueueConfig {
        instruction_timeout_ms: 300,
        idle_poll_ms: 10,
        ..QueueConfig::default()
    };
    let queue = SerialQueue::new(Box::new(transport), Arc::new(OutputRouter::new()), config);
    let shutdown = Shutdown::new();
    queue.spawn(shutdown.token()).unwrap();
    (queue, firmware, shutdown)
}

#[tokio::test]
async fn test_identify_simulated_mk3s() {
    let (queue, firmware, shutdown) = queue();
    let _simulator = spawn_simulator(firmware);

    let info = probes::identify(&queue, &shutdown.token(), "3.10.0").await.unwrap();
    assert_eq!(info.printer_type, PrinterType::Mk3s);
    assert_eq!(info.firmware.version, "3.10.0");
    assert!(info.firmware.supported);
    assert_eq!(info.nozzle_diameter, 0.4);
    shutdown.trigger();
}

#[tokio::test]
async fn test_old_firmware_is_flagged_not_rejected() {
    let (queue, mut firmware, shutdown) = queue();
    let token = shutdown.token();
    let probe = tokio::spawn({
        let queue = queue.clone();
        async move { probes::firmware_version(&queue, &token, "3.10.0").await }
    });

    assert_eq!(firmware.next_written(WAIT).await.as_deref(), Some("M115"));
    firmware.send_line("FIRMWARE_NAME:Prusa-Firmware 3.9.3 based on Marlin");
    let info = probe.await.unwrap().unwrap();
    assert_eq!(info.version, "3.9.3");
    assert!(!info.supported);
    shutdown.trigger();
}

#[tokio::test]
async fn test_unknown_printer_gets_notice() {
    let (queue, mut firmware, shutdown) = queue();
    let token = shutdown.token();
    let probe = tokio::spawn({
        let queue = queue.clone();
        async move { probes::printer_type(&queue, &token).await }
    });

    assert_eq!(firmware.next_written(WAIT).await.as_deref(), Some("M862.2 Q"));
    firmware.send_line("250");
    firmware.send_line("ok");
    assert!(matches!(
        probe.await.unwrap(),
        Err(ProbeError::UnsupportedPrinter(250))
    ));
    assert_eq!(
        firmware.next_written(WAIT).await.as_deref(),
        Some("M117 Unsupported printer")
    );
    shutdown.trigger();
}

#[tokio::test]
async fn test_silent_printer_fails_probe() {
    let (queue, _firmware, shutdown) = queue();
    let result = probes::nozzle_diameter(&queue, &shutdown.token()).await;
    assert!(matches!(result, Err(ProbeError::Failed { .. })));
    shutdown.trigger();
}
