//! End-to-end behavior of a device driven against the firmware emulator.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dsplink_device::fault::ALERT_SEVERITY_FATAL;
use dsplink_device::{
    ChannelDirection, ChannelId, ChannelState, CodecFormat, Device, DeviceConfig, DeviceError,
    DeviceId, DeviceRegistry, Emulator, FaultSeverity, ReadMode, SimConfig, WriteOutcome,
};
use dsplink_frame::function;
use dsplink_ring::RingPair;

const READ: ReadMode = ReadMode::Timeout(Duration::from_secs(2));

fn config() -> DeviceConfig {
    let mut config = DeviceConfig::default();
    config.engine.command_timeout = Duration::from_millis(40);
    config.engine.watchdog_period = Duration::from_millis(5);
    config.engine.max_retries = 2;
    config.channels.pairs = 2;
    config
}

fn harness_with(config: DeviceConfig) -> (Emulator, Device) {
    let rings = RingPair::new(&config.transport.rings).unwrap();
    let sim = Emulator::spawn(SimConfig::default(), rings.clone()).unwrap();
    let device = Device::attach("test", config, rings, sim.board()).unwrap();
    device.start().unwrap();
    device.boot().unwrap();
    (sim, device)
}

fn harness() -> (Emulator, Device) {
    harness_with(config())
}

fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

fn enc(pair: u16) -> ChannelId {
    ChannelId::new(pair, ChannelDirection::Encoder)
}

fn dec(pair: u16) -> ChannelId {
    ChannelId::new(pair, ChannelDirection::Decoder)
}

#[test]
fn boot_and_ping() {
    let (sim, device) = harness();
    assert_eq!(sim.commands_seen(function::SET_CLOCK), 1);
    assert_eq!(sim.commands_seen(function::SET_ETH_HEADER), 1);
    assert_eq!(sim.commands_seen(function::SET_ALERT_MODE), 1);

    device.ping().unwrap();
    assert_eq!(sim.commands_seen(function::PING), 1);
    assert_eq!(device.engine().outstanding(), 0);
}

#[test]
fn ulaw_to_g729a_shrinks_each_frame() {
    let (_sim, device) = harness();
    let handle = device.open(CodecFormat::Ulaw, CodecFormat::G729a).unwrap();
    assert_eq!(handle.channel, enc(0));

    assert_eq!(device.write(&handle, &[0x7f; 160]).unwrap(), WriteOutcome::Queued);
    let first = device.read(&handle, READ).unwrap();
    assert_eq!(first.data.len(), 20);
    assert_eq!(first.format, Some(CodecFormat::G729a));
    assert_eq!(first.sequence, 0);
    assert_eq!(first.timestamp, 0);

    device.write(&handle, &[0x7f; 160]).unwrap();
    let second = device.read(&handle, READ).unwrap();
    assert_eq!(second.sequence, 1);
    assert_eq!(second.timestamp, 160);
    assert_eq!(device.router().in_flight(handle.channel), 0);
}

#[test]
fn decoder_half_expands_back_to_linear() {
    let (_sim, device) = harness();
    let handle = device.open(CodecFormat::G729a, CodecFormat::Slin).unwrap();
    assert_eq!(handle.channel, dec(0));

    device.write(&handle, &[0x11; 20]).unwrap();
    let payload = device.read(&handle, READ).unwrap();
    assert_eq!(payload.format, Some(CodecFormat::Slin));
    assert_eq!(payload.data.len(), 320);
}

#[test]
fn read_into_rejects_short_buffer_and_keeps_frame() {
    let (_sim, device) = harness();
    let handle = device.open(CodecFormat::Ulaw, CodecFormat::G729a).unwrap();
    device.write(&handle, &[1; 160]).unwrap();
    wait_until("payload", || device.router().queued(handle.channel) == 1);

    let mut small = [0u8; 8];
    match device.read_into(&handle, &mut small, ReadMode::NonBlocking) {
        Err(DeviceError::BufferTooSmall { needed: 20, got: 8 }) => {}
        other => panic!("expected BufferTooSmall, got {other:?}"),
    }
    let mut buf = [0u8; 64];
    assert_eq!(device.read_into(&handle, &mut buf, ReadMode::NonBlocking).unwrap(), 20);
    assert!(matches!(
        device.read(&handle, ReadMode::NonBlocking),
        Err(DeviceError::WouldBlock)
    ));
}

#[test]
fn duplicate_replies_complete_each_command_once() {
    let (sim, device) = harness();
    sim.set_duplicate_replies(true);

    let handle = device.open(CodecFormat::Ulaw, CodecFormat::G729a).unwrap();
    device.statistics().unwrap();
    device.ping().unwrap();

    wait_until("duplicate responses", || device.engine().stats().duplicates > 0);
    let stats = device.engine().stats();
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.timed_out, 0);
    assert_eq!(device.engine().outstanding(), 0);
    assert_eq!(sim.commands_seen(function::CREATE_CHANNEL), 2);

    device.close(handle).unwrap();
}

#[test]
fn silent_device_exhausts_retries() {
    let (sim, device) = harness();
    sim.set_mute(true);

    let err = device.ping().unwrap_err();
    match err {
        DeviceError::CommandTimeout {
            function: function::PING,
            attempts,
            ..
        } => assert_eq!(attempts, 3),
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(sim.commands_seen(function::PING), 3);
    assert_eq!(device.status().fault, Some(FaultSeverity::Soft));

    // Soft fault with nothing open: the next allocation resets first.
    sim.set_mute(false);
    device.open(CodecFormat::Ulaw, CodecFormat::G729a).unwrap();
    assert_eq!(sim.stats().resets, 1);
    assert_eq!(device.status().fault, None);
}

#[test]
fn dropped_commands_are_retransmitted() {
    let (sim, device) = harness();
    sim.set_drop_commands(2);

    device.ping().unwrap();
    assert_eq!(sim.commands_seen(function::PING), 3);
    assert_eq!(sim.stats().dropped, 2);
    assert!(device.engine().stats().retransmitted >= 2);
    assert_eq!(device.status().fault, None);
}

#[test]
fn allocation_is_idempotent() {
    let (sim, device) = harness();
    device.allocate(enc(0), CodecFormat::Ulaw, CodecFormat::G729a).unwrap();
    device.allocate(enc(0), CodecFormat::Ulaw, CodecFormat::G729a).unwrap();
    assert_eq!(sim.commands_seen(function::CREATE_CHANNEL), 2);

    let encoder = device.open_channel(enc(0), CodecFormat::Ulaw, CodecFormat::G729a).unwrap();
    let decoder = device.open_channel(dec(0), CodecFormat::G729a, CodecFormat::Ulaw).unwrap();
    assert_eq!(sim.commands_seen(function::CREATE_CHANNEL), 2);
    assert_eq!(sim.commands_seen(function::CONNECT), 1);
    assert_eq!(device.channels().state(enc(0)).unwrap(), ChannelState::Busy);

    device.close(encoder).unwrap();
    assert_eq!(sim.live_channels(), 2);
    device.close(decoder).unwrap();
    assert_eq!(sim.live_channels(), 0);
    assert_eq!(device.channels().state(enc(0)).unwrap(), ChannelState::Unbuilt);
}

#[test]
fn complements_opened_concurrently_share_one_build() {
    let (sim, device) = harness();
    let device = Arc::new(device);

    let a = {
        let device = device.clone();
        thread::spawn(move || device.open_channel(enc(1), CodecFormat::Alaw, CodecFormat::G723))
    };
    let b = {
        let device = device.clone();
        thread::spawn(move || device.open_channel(dec(1), CodecFormat::G723, CodecFormat::Alaw))
    };
    let a = a.join().unwrap().unwrap();
    let b = b.join().unwrap().unwrap();

    assert_eq!(sim.commands_seen(function::CREATE_CHANNEL), 2);
    assert_eq!(sim.commands_seen(function::CONNECT), 1);
    device.close(a).unwrap();
    device.close(b).unwrap();
}

#[test]
fn busy_channel_cannot_be_opened_twice() {
    let (_sim, device) = harness();
    let handle = device.open_channel(enc(0), CodecFormat::Ulaw, CodecFormat::G729a).unwrap();
    assert!(matches!(
        device.open_channel(enc(0), CodecFormat::Ulaw, CodecFormat::G729a),
        Err(DeviceError::ChannelBusy(channel)) if channel == enc(0)
    ));
    // The complement is still free but built for other formats.
    assert!(matches!(
        device.open_channel(dec(0), CodecFormat::G723, CodecFormat::Ulaw),
        Err(DeviceError::ChannelBusy(_))
    ));
    device.close(handle).unwrap();
}

#[test]
fn rejected_connect_rolls_back() {
    let (sim, device) = harness();
    sim.set_reject(Some((function::CONNECT, 5)));

    let err = device.open(CodecFormat::Ulaw, CodecFormat::G729a).unwrap_err();
    match err {
        DeviceError::Allocation { channel, step, source } => {
            assert_eq!(channel, enc(0));
            assert_eq!(step, "connect");
            assert!(matches!(
                *source,
                DeviceError::Rejected {
                    function: function::CONNECT,
                    status: 5
                }
            ));
        }
        other => panic!("expected allocation error, got {other:?}"),
    }
    assert_eq!(sim.live_channels(), 0);
    assert_eq!(device.channels().state(enc(0)).unwrap(), ChannelState::Unbuilt);

    sim.set_reject(None);
    device.open(CodecFormat::Ulaw, CodecFormat::G729a).unwrap();
    assert_eq!(sim.live_channels(), 2);
}

#[test]
fn failed_teardown_is_reported_and_reclaimed_by_reset() {
    let (sim, device) = harness();
    let handle = device.open(CodecFormat::Ulaw, CodecFormat::G729a).unwrap();
    sim.set_reject(Some((function::DESTROY_CHANNEL, 5)));

    match device.close(handle).unwrap_err() {
        DeviceError::Allocation { channel, step, source } => {
            assert_eq!(channel, enc(0));
            assert_eq!(step, "teardown");
            assert!(matches!(
                *source,
                DeviceError::Rejected {
                    function: function::DESTROY_CHANNEL,
                    status: 5
                }
            ));
        }
        other => panic!("expected allocation error, got {other:?}"),
    }
    assert_eq!(sim.live_channels(), 2);
    assert_eq!(device.status().fault, Some(FaultSeverity::Soft));

    sim.set_reject(None);
    device.open(CodecFormat::Ulaw, CodecFormat::G729a).unwrap();
    assert_eq!(sim.stats().resets, 1);
    assert_eq!(sim.live_channels(), 2);
    assert_eq!(device.status().fault, None);
}

#[test]
fn failed_teardown_blocks_rebuild() {
    let (sim, device) = harness();
    device.allocate(enc(0), CodecFormat::Ulaw, CodecFormat::G729a).unwrap();
    sim.set_reject(Some((function::DESTROY_CHANNEL, 5)));

    let err = device
        .open_channel(enc(0), CodecFormat::Alaw, CodecFormat::G729a)
        .unwrap_err();
    assert!(matches!(
        err,
        DeviceError::Allocation { step: "teardown before rebuild", .. }
    ));
    assert_eq!(sim.commands_seen(function::CREATE_CHANNEL), 2);
    assert_eq!(sim.live_channels(), 2);
}

#[test]
fn exhausted_device_reports_no_free_channel() {
    let mut cfg = config();
    cfg.channels.pairs = 1;
    let (_sim, device) = harness_with(cfg);

    let _held = device.open(CodecFormat::Ulaw, CodecFormat::G729a).unwrap();
    assert!(matches!(
        device.open(CodecFormat::Ulaw, CodecFormat::G729a),
        Err(DeviceError::NoFreeChannel { .. })
    ));
    assert!(matches!(
        device.open(CodecFormat::Ulaw, CodecFormat::Alaw),
        Err(DeviceError::UnsupportedConversion { .. })
    ));
}

#[test]
fn closed_handle_is_stale() {
    let (_sim, device) = harness();
    let handle = device.open(CodecFormat::Ulaw, CodecFormat::G729a).unwrap();
    device.close(handle).unwrap();

    assert!(matches!(device.write(&handle, &[0; 160]), Err(DeviceError::InvalidChannel(_))));
    assert!(matches!(device.read(&handle, ReadMode::NonBlocking), Err(DeviceError::InvalidChannel(_))));
    assert!(matches!(device.close(handle), Err(DeviceError::InvalidChannel(_))));

    // Reopening the same channel hands out a new generation.
    let again = device.open(CodecFormat::Ulaw, CodecFormat::G729a).unwrap();
    assert_eq!(again.channel, handle.channel);
    assert_ne!(again.generation, handle.generation);
    assert!(matches!(device.write(&handle, &[0; 160]), Err(DeviceError::InvalidChannel(_))));
}

#[test]
fn fatal_alert_fails_fast_without_auto_reset() {
    let mut cfg = config();
    cfg.channels.auto_reset = false;
    let (sim, device) = harness_with(cfg);
    let handle = device.open(CodecFormat::Ulaw, CodecFormat::G729a).unwrap();

    sim.inject_alert(0x42, ALERT_SEVERITY_FATAL);
    wait_until("fatal fault", || device.status().fault == Some(FaultSeverity::Fatal));

    assert!(matches!(
        device.read(&handle, ReadMode::NonBlocking),
        Err(DeviceError::DeviceFault(FaultSeverity::Fatal))
    ));
    assert!(matches!(device.ping(), Err(DeviceError::DeviceFault(FaultSeverity::Fatal))));
    assert!(matches!(
        device.open(CodecFormat::Ulaw, CodecFormat::G729a),
        Err(DeviceError::DeviceFault(FaultSeverity::Fatal))
    ));
    assert_eq!(device.status().last_alert, Some(0x42));

    device.reset().unwrap();
    assert_eq!(device.status().fault, None);
    let fresh = device.open(CodecFormat::Ulaw, CodecFormat::G729a).unwrap();
    device.write(&fresh, &[0; 160]).unwrap();
    assert_eq!(device.read(&fresh, READ).unwrap().data.len(), 20);
}

#[test]
fn fatal_alert_recovers_on_next_open_with_auto_reset() {
    let (sim, device) = harness();
    let old = device.open(CodecFormat::Ulaw, CodecFormat::G729a).unwrap();

    sim.inject_alert(7, ALERT_SEVERITY_FATAL);
    wait_until("fatal fault", || device.status().fault == Some(FaultSeverity::Fatal));
    assert!(device.engine().stats().acks_sent >= 1);

    let fresh = device.open(CodecFormat::Ulaw, CodecFormat::G729a).unwrap();
    assert_eq!(sim.stats().resets, 1);
    assert_eq!(device.status().fault, None);
    assert!(device.write(&old, &[0; 160]).is_err());

    device.write(&fresh, &[0; 160]).unwrap();
    assert_eq!(device.read(&fresh, READ).unwrap().sequence, 0);
}

#[test]
fn blocked_reader_wakes_on_fatal_alert() {
    let (sim, device) = harness();
    let device = Arc::new(device);
    let handle = device.open(CodecFormat::Ulaw, CodecFormat::G729a).unwrap();

    let reader = {
        let device = device.clone();
        thread::spawn(move || device.read(&handle, ReadMode::Blocking))
    };
    thread::sleep(Duration::from_millis(20));
    sim.inject_alert(1, ALERT_SEVERITY_FATAL);

    assert!(matches!(
        reader.join().unwrap(),
        Err(DeviceError::DeviceFault(FaultSeverity::Fatal))
    ));
}

#[test]
fn full_submit_ring_queues_instead_of_losing_frames() {
    let mut cfg = config();
    cfg.transport.rings.tx_capacity = 2;
    cfg.router.max_samples_in_flight = 160 * 64;
    let (_sim, device) = harness_with(cfg);
    let handle = device.open(CodecFormat::Ulaw, CodecFormat::G729a).unwrap();

    for _ in 0..32 {
        assert_eq!(device.write(&handle, &[3; 160]).unwrap(), WriteOutcome::Queued);
    }
    for expected in 0..32u16 {
        assert_eq!(device.read(&handle, READ).unwrap().sequence, expected);
    }
    assert_eq!(device.transport().stats().pending, 0);
}

#[test]
fn writes_beyond_in_flight_budget_are_dropped() {
    let mut cfg = config();
    cfg.router.max_samples_in_flight = 320;
    let (mut sim, device) = harness_with(cfg);
    let handle = device.open(CodecFormat::Ulaw, CodecFormat::G729a).unwrap();

    sim.stop();
    assert_eq!(device.write(&handle, &[0; 160]).unwrap(), WriteOutcome::Queued);
    assert_eq!(device.write(&handle, &[0; 160]).unwrap(), WriteOutcome::Queued);
    assert_eq!(device.write(&handle, &[0; 160]).unwrap(), WriteOutcome::Dropped);
    assert_eq!(device.router().stats().throttled, 1);
    assert_eq!(device.router().in_flight(handle.channel), 320);
}

#[test]
fn statistics_come_from_the_firmware() {
    let (_sim, device) = harness();
    let _a = device.open(CodecFormat::Ulaw, CodecFormat::G729a).unwrap();
    let stats = device.statistics().unwrap();
    assert_eq!(stats.active_channels, 2);
    assert!(stats.frames_received > 0);

    let status = device.status();
    assert_eq!(status.name, "test");
    assert_eq!(status.channels.len(), 4);
    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["channels"][0]["channel"], "enc0");
    assert_eq!(json["channels"][0]["state"], "busy");
}

#[test]
fn zero_pairs_is_rejected() {
    let mut cfg = config();
    cfg.channels.pairs = 0;
    let rings = RingPair::new(&cfg.transport.rings).unwrap();
    let sim = Emulator::spawn(SimConfig::default(), rings.clone()).unwrap();
    assert!(matches!(
        Device::attach("empty", cfg, rings, sim.board()),
        Err(DeviceError::InvalidConfig(_))
    ));
}

#[test]
fn registry_spreads_opens_across_devices() {
    let mut cfg = config();
    cfg.channels.pairs = 1;
    let (_sim_a, dev_a) = harness_with(cfg.clone());
    let (_sim_b, dev_b) = harness_with(cfg);

    let registry = DeviceRegistry::new();
    let a = registry.add(dev_a);
    let b = registry.add(dev_b);
    assert_ne!(a, b);
    assert_eq!(registry.len(), 2);

    let (first, _) = registry.open(CodecFormat::Ulaw, CodecFormat::G729a).unwrap();
    let (second, _) = registry.open(CodecFormat::Ulaw, CodecFormat::G729a).unwrap();
    assert_eq!(first, a);
    assert_eq!(second, b);
    assert!(matches!(
        registry.open(CodecFormat::Ulaw, CodecFormat::G729a),
        Err(DeviceError::NoFreeChannel { .. })
    ));
    assert!(matches!(
        registry.open(CodecFormat::Slin, CodecFormat::Ulaw),
        Err(DeviceError::UnsupportedConversion { .. })
    ));

    let detached = registry.detach(a).unwrap();
    assert!(!detached.is_running());
    assert!(matches!(registry.get(a), Err(DeviceError::UnknownDevice(id)) if id == a));
    registry.shutdown();
    assert!(!registry.get(b).unwrap().is_running());
}

#[test]
fn registry_reports_fatal_fault_over_full_devices() {
    let mut cfg = config();
    cfg.channels.pairs = 1;
    cfg.channels.auto_reset = false;
    let (sim_a, dev_a) = harness_with(cfg.clone());
    let (_sim_b, dev_b) = harness_with(cfg);

    let registry = DeviceRegistry::new();
    let a = registry.add(dev_a);
    let b = registry.add(dev_b);
    registry.get(b).unwrap().open(CodecFormat::Ulaw, CodecFormat::G729a).unwrap();

    sim_a.inject_alert(0x0E01, ALERT_SEVERITY_FATAL);
    let faulted = registry.get(a).unwrap();
    wait_until("fatal fault", || faulted.status().fault == Some(FaultSeverity::Fatal));

    assert!(matches!(
        registry.open(CodecFormat::Ulaw, CodecFormat::G729a),
        Err(DeviceError::DeviceFault(FaultSeverity::Fatal))
    ));
    registry.shutdown();
}

#[test]
fn registry_rejects_duplicate_ids() {
    let (_sim_a, dev_a) = harness();
    let (_sim_b, dev_b) = harness();
    let registry = DeviceRegistry::new();

    registry.attach(DeviceId(7), dev_a).unwrap();
    assert!(matches!(
        registry.attach(DeviceId(7), dev_b),
        Err(DeviceError::DuplicateDevice(DeviceId(7)))
    ));
    assert_eq!(registry.ids(), vec![DeviceId(7)]);
}
