use crate::bus::*;

use sio_lib::devices::{LogEntry, Reply, ScriptedDevice};
use sio_lib::{CassetteBlockIo, HostState, SioConfig, SioError, SioHost, SioInterface};

use common::checksum::compute_checksum;
use common::command::{CmdResponse, SioCommand};
use common::constants::*;
use common::dcb::Dcb;

use std::sync::{Arc, Mutex};

const BUFFER: u16 = 0x0600;
const HOOK_PC: u16 = 0xE459;
const RTS: u8 = 0x60;

fn host_with_request(device: u8, command: u8, mode: u8, length: u16, aux: [u8; 2]) -> HostState {
    let mut host = HostState::new();
    host.mem_write_byte(BRKKEY, 0x80);

    let dcb = Dcb {
        ddevic: device,
        dunit: 1,
        dcomnd: command,
        dstats: mode,
        dbuf: BUFFER.to_le_bytes(),
        dtimlo: 7,
        dunuse: 0,
        dbyt: length.to_le_bytes(),
        daux: aux,
    };
    host.load(&dcb.to_bytes(), Dcb::ADDR);
    host
}

fn status_request() -> HostState {
    host_with_request(0x31, GET_STATUS_COMMAND, MODE_READ, STATUS_DATA.len() as u16, [0, 0])
}

fn accel_bus() -> Bus {
    Bus::with_config(SioConfig::accelerated())
}

#[test]
fn status_read() {
    let mut bus = accel_bus();
    let (id, log) = bus.add_scripted(status_device());
    let mut host = status_request();

    assert_eq!(bus.sio.on_serial_hook(&mut host, HOOK_PC), RTS);

    assert_eq!(host.read(BUFFER, 4), STATUS_DATA);
    assert_eq!(host.mem_read_byte(CHKSUM), compute_checksum(&STATUS_DATA));
    assert_eq!(host.mem_read_word(BUFRLO), BUFFER + 4);
    assert_eq!(host.mem_read_byte(STATUS), STATUS_SUCCESS);
    assert_eq!(host.mem_read_byte(DSTATS), STATUS_SUCCESS);
    assert_eq!(host.mem_read_byte(TIMFLG), 1);
    assert_eq!(host.mem_read_byte(CHKSNT), 0xFF);
    assert_eq!(host.mem_read_word(CDTMA1), CDTMA1_DEFAULT);
    assert_eq!(host.mem_read_byte(AUDF3), AUDF3_DEFAULT);
    assert_eq!(host.mem_read_byte(SKCTL), SKCTL_DEFAULT);
    assert_eq!(host.mem_read_byte(SSKCTL), SKCTL_DEFAULT);

    assert_eq!(host.a(), 0);
    assert_eq!(host.x(), 0xFE);
    assert_eq!(host.y(), STATUS_SUCCESS);
    assert!(host.get_status().get_carry());
    assert!(!host.get_status().get_negative());

    // Nothing went over the wire, but the time it would have taken is accounted for.
    assert!(bus.port.is_empty());
    let byte = DEFAULT_CYCLES_PER_BYTE;
    let skew = ACCEL_COMMAND_FRAME_SKEW + byte + REPLY_DELAY_TICKS + byte + 5 * byte;
    assert_eq!(bus.sio.accel_time_skew(id), skew);
    assert_eq!(bus.sio.take_time_skew(), skew as u64);
    assert_eq!(bus.sio.take_time_skew(), 0);

    assert!(matches!(
        log.entries()[..],
        [LogEntry::AccelCommand(req)] if req.length == 4 && req.is_read()
    ));
    assert!(!bus.sio.is_command_active(id));
}

#[test]
fn matches_bus_transfer() {
    let mut bus = accel_bus();
    bus.add_scripted(status_device());
    bus.command(0x31, GET_STATUS_COMMAND, 0, 0);
    bus.run_idle();
    let wire = bus.values();

    let mut bus = accel_bus();
    bus.add_scripted(status_device());
    let mut host = status_request();
    bus.sio.on_serial_hook(&mut host, HOOK_PC);

    assert_eq!(wire[..2], [ACK, COMPLETE]);
    assert_eq!(wire[2..6], host.read(BUFFER, 4)[..]);
    assert_eq!(wire[6], host.mem_read_byte(CHKSUM));

    // COMPLETE on the wire is success for the OS.
    assert_eq!(host.mem_read_byte(STATUS), STATUS_SUCCESS);
    assert_eq!(host.mem_read_byte(DSTATS), STATUS_SUCCESS);
    assert_eq!(host.y(), STATUS_SUCCESS);
    assert!(host.get_status().get_carry());
}

#[test]
fn nak_status() {
    let mut bus = accel_bus();
    bus.add_scripted(ScriptedDevice::new(0x31));
    let mut host = status_request();

    assert_eq!(bus.sio.on_serial_hook(&mut host, HOOK_PC), RTS);
    assert_eq!(host.y(), STATUS_NAK);
    assert_eq!(host.mem_read_byte(DSTATS), STATUS_NAK);
    assert!(host.get_status().get_negative());
    assert!(host.get_status().get_carry());
}

#[test]
fn error_status_keeps_data() {
    let mut bus = accel_bus();
    let reply = Reply::Error(STATUS_DATA.to_vec());
    bus.add_scripted(ScriptedDevice::new(0x31).with_reply(GET_STATUS_COMMAND, reply));
    let mut host = status_request();

    bus.sio.on_serial_hook(&mut host, HOOK_PC);
    assert_eq!(host.y(), STATUS_DEVICE_ERROR);
    assert_eq!(host.read(BUFFER, 4), STATUS_DATA);
}

#[test]
fn short_read_times_out() {
    let mut bus = accel_bus();
    let reply = Reply::Data(vec![1, 2]);
    bus.add_scripted(ScriptedDevice::new(0x31).with_reply(GET_STATUS_COMMAND, reply));
    let mut host = status_request();

    bus.sio.on_serial_hook(&mut host, HOOK_PC);
    assert_eq!(host.y(), STATUS_TIMEOUT);
    assert_eq!(host.mem_read_byte(TIMFLG), 0);
    assert_eq!(host.read(BUFFER, 4), [1, 2, 0, 0]);
    assert_eq!(host.mem_read_word(BUFRLO), BUFFER + 2);
}

#[test]
fn write_request() {
    let mut bus = accel_bus();
    let writer = ScriptedDevice::new(0x50).with_reply(0x57, Reply::Receive { len: 4 });
    let (_, log) = bus.add_scripted(writer);

    let mut host = host_with_request(0x50, 0x57, MODE_WRITE, 4, [0, 0]);
    host.load(&[9, 8, 7, 6], BUFFER);

    assert_eq!(bus.sio.on_serial_hook(&mut host, HOOK_PC), RTS);
    assert_eq!(host.y(), STATUS_SUCCESS);
    assert_eq!(
        log.entries()[1],
        LogEntry::ReceiveComplete {
            id: ScriptedDevice::RECEIVE_ID,
            data: vec![9, 8, 7, 6],
            checksum_ok: true,
        }
    );
}

#[test]
fn short_write_fails_checksum() {
    let mut bus = accel_bus();
    let writer = ScriptedDevice::new(0x50).with_reply(0x57, Reply::Receive { len: 4 });
    let (_, log) = bus.add_scripted(writer);

    let mut host = host_with_request(0x50, 0x57, MODE_WRITE, 2, [0, 0]);
    host.load(&[9, 8, 7, 6], BUFFER);

    bus.sio.on_serial_hook(&mut host, HOOK_PC);
    assert_eq!(host.y(), STATUS_DEVICE_ERROR);
    assert_eq!(
        log.entries()[1],
        LogEntry::ReceiveComplete {
            id: ScriptedDevice::RECEIVE_ID,
            data: vec![9, 8, 0, 0],
            checksum_ok: false,
        }
    );
}

#[test]
fn bypass() {
    let mut bus = accel_bus();
    let (_, log) =
        bus.add_scripted(ScriptedDevice::new(0x31).with_reply(GET_STATUS_COMMAND, Reply::Bypass));
    let mut host = status_request();

    assert_eq!(bus.sio.on_serial_hook(&mut host, HOOK_PC), 0);
    assert_eq!(host.mem_read_byte(DSTATS), MODE_READ);
    assert_eq!(host.mem_read_byte(STATUS), 0);
    assert_eq!(bus.sio.take_time_skew(), 0);
    assert_eq!(log.entries().len(), 1);

    // The same command on the bus gets answered normally.
    bus.command(0x31, GET_STATUS_COMMAND, 0, 0);
    bus.run_idle();
    assert_eq!(bus.values(), [ACK, COMPLETE]);
}

// Queues an ACK and a delay, then answers `response`.
fn queue_then(
    response: CmdResponse,
) -> (FnDevice<impl FnMut(&SioCommand, &mut SioInterface<'_>) -> CmdResponse + Send>, Calls) {
    fn_device(move |_: &SioCommand, iface: &mut SioInterface<'_>| {
        iface.begin_command();
        iface.send_ack();
        iface.delay(100);
        response
    })
}

#[test]
fn declining_after_queueing_restores_skew() {
    let mut bus = accel_bus();
    let (dev, calls) = queue_then(CmdResponse::NotHandled);
    let id = bus.add(dev);

    let mut host = host_with_request(0x50, 0x53, 0, 0, [0, 0]);
    assert_eq!(bus.sio.on_serial_hook(&mut host, HOOK_PC), 0);

    assert!(matches!(bus.sio.take_faults()[..], [SioError::NotHandledAfterQueue { device: 0x50 }]));
    assert_eq!(*calls.lock().unwrap(), ["begin", "abort"]);
    assert_eq!(bus.sio.accel_time_skew(id), 0);
    assert_eq!(bus.sio.take_time_skew(), 0);
    assert_eq!(host.mem_read_byte(STATUS), 0);
}

#[test]
fn bypass_after_queueing_faults() {
    let mut bus = accel_bus();
    let (dev, calls) = queue_then(CmdResponse::BypassAccel);
    let id = bus.add(dev);

    let mut host = host_with_request(0x50, 0x53, 0, 0, [0, 0]);
    assert_eq!(bus.sio.on_serial_hook(&mut host, HOOK_PC), 0);

    assert!(matches!(bus.sio.take_faults()[..], [SioError::BypassAfterQueue { device: 0x50 }]));
    assert_eq!(*calls.lock().unwrap(), ["begin", "abort"]);
    assert!(!bus.sio.is_command_active(id));
    assert_eq!(bus.sio.accel_time_skew(id), 0);
    assert_eq!(bus.sio.take_time_skew(), 0);
}

#[test]
fn rejected_requests() {
    let check = |setup: &dyn Fn(&mut HostState), config: SioConfig| {
        let mut bus = Bus::with_config(config);
        let (_, log) = bus.add_scripted(status_device());
        let mut host = status_request();
        setup(&mut host);

        assert_eq!(bus.sio.on_serial_hook(&mut host, HOOK_PC), 0);
        assert_eq!(host.mem_read_byte(STATUS), 0);
        assert!(log.is_empty());
    };

    check(&|host| host.mem_write_byte(BRKKEY, 0), SioConfig::accelerated());
    check(&|host| host.get_status_mut().set_irq_disable(true), SioConfig::accelerated());
    check(&|host| host.mem_write_byte(DSTATS, MODE_READ | MODE_WRITE), SioConfig::accelerated());
    check(
        &|host| {
            host.mem_write_word(DDEVIC + 4, DDEVIC);
            host.mem_write_word(DDEVIC + 8, 0x20);
        },
        SioConfig::accelerated(),
    );
    check(&|_| {}, SioConfig::default());
    check(&|_| {}, SioConfig { other_accel_enabled: true, ..Default::default() });
}

#[test]
fn busy_bus_rejects() {
    let mut bus = accel_bus();
    bus.add_scripted(status_device());
    bus.command(0x31, GET_STATUS_COMMAND, 0, 0);

    let mut host = status_request();
    assert_eq!(bus.sio.on_serial_hook(&mut host, HOOK_PC), 0);

    bus.run_idle();
    bus.sio.begin_command_line();
    assert_eq!(bus.sio.on_serial_hook(&mut host, HOOK_PC), 0);
}

#[test]
fn override_detect() {
    let config = SioConfig { disk_override_detect_enabled: true, ..SioConfig::accelerated() };
    let mut bus = Bus::with_config(config);
    bus.add_scripted(status_device());

    let mut host = status_request();
    assert_eq!(bus.sio.on_serial_hook(&mut host, HOOK_PC), 0);

    bus.command(0x31, GET_STATUS_COMMAND, 0, 0);
    bus.run_idle();

    assert_eq!(bus.sio.on_serial_hook(&mut host, HOOK_PC), RTS);
}

#[test]
fn debugger_device() {
    let config = SioConfig { debugger_device_id: 0x50, ..Default::default() };
    assert!(config.wants_serial_hook());

    let mut bus = Bus::with_config(config);
    bus.add_scripted(ScriptedDevice::new(0x50).with_reply(0x53, Reply::AckComplete));

    let mut host = host_with_request(0x50, 0x53, 0, 0, [0, 0]);
    assert_eq!(bus.sio.on_serial_hook(&mut host, HOOK_PC), RTS);
    assert_eq!(host.y(), STATUS_SUCCESS);
}

#[test]
fn fast_boot_retries() {
    let mut bus = accel_bus();
    let poller = ScriptedDevice::new(FAST_BOOT_DEVICE).with_reply(POLL_COMMAND, Reply::Ignore);
    let (_, log) = bus.add_scripted(poller);

    let mut host = host_with_request(FAST_BOOT_DEVICE, POLL_COMMAND, MODE_READ, 0, [0, 0]);
    assert_eq!(bus.sio.on_serial_hook(&mut host, HOOK_PC), RTS);
    assert_eq!(host.y(), STATUS_TIMEOUT);
    assert_eq!(host.mem_read_byte(TIMFLG), 0);

    let polls: Vec<u8> = log
        .entries()
        .into_iter()
        .map(|entry| match entry {
            LogEntry::AccelCommand(req) => req.poll_count,
            other => panic!("Unexpected {other:?}"),
        })
        .collect();
    let retries = DEFAULT_FAST_BOOT_POLL_RETRIES;
    assert_eq!(polls, (0..=retries).collect::<Vec<_>>());
    assert_eq!(bus.sio.poll_count(), retries + 2);
}

#[test]
fn fast_boot_max_retries() {
    let config = SioConfig { fast_boot_poll_retries: u8::MAX, ..SioConfig::accelerated() };
    let mut bus = Bus::with_config(config.clone());
    let poller = ScriptedDevice::new(FAST_BOOT_DEVICE).with_reply(POLL_COMMAND, Reply::Ignore);
    let (_, log) = bus.add_scripted(poller);

    let mut host = host_with_request(FAST_BOOT_DEVICE, POLL_COMMAND, MODE_READ, 0, [0, 0]);
    assert_eq!(bus.sio.on_serial_hook(&mut host, HOOK_PC), RTS);
    assert_eq!(host.y(), STATUS_TIMEOUT);
    assert_eq!(log.entries().len(), u8::MAX as usize + 1);

    // With no device at all, the retries still run out.
    let mut bus = Bus::with_config(config);
    let mut host = host_with_request(FAST_BOOT_DEVICE, POLL_COMMAND, MODE_READ, 0, [0, 0]);
    assert_eq!(bus.sio.on_serial_hook(&mut host, HOOK_PC), RTS);
    assert_eq!(host.mem_read_byte(DSTATS), STATUS_TIMEOUT);
}

#[test]
fn fast_boot_off() {
    let config = SioConfig { fast_boot_enabled: false, ..SioConfig::accelerated() };
    let mut bus = Bus::with_config(config);
    let mut host = host_with_request(FAST_BOOT_DEVICE, POLL_COMMAND, MODE_READ, 0, [0, 0]);
    assert_eq!(bus.sio.on_serial_hook(&mut host, HOOK_PC), 0);
}

#[test]
fn absent_disk_times_out() {
    let mut bus = accel_bus();
    let mut host = status_request();
    assert_eq!(bus.sio.on_serial_hook(&mut host, HOOK_PC), RTS);
    assert_eq!(host.y(), STATUS_TIMEOUT);

    let mut bus = accel_bus();
    bus.sio.set_disk_drive_enabled(0, true);
    let mut host = status_request();
    assert_eq!(bus.sio.on_serial_hook(&mut host, HOOK_PC), 0);
}

#[derive(Default, Clone)]
struct Tape {
    calls: Arc<Mutex<Vec<(bool, u16, u16, Option<f32>)>>>,
}

impl CassetteBlockIo for Tape {
    fn read_block(
        &mut self,
        host: &mut dyn SioHost,
        address: u16,
        length: u16,
        timeout_secs: Option<f32>,
    ) -> u8 {
        self.calls.lock().unwrap().push((false, address, length, timeout_secs));
        host.mem_write_byte(address, 0x55);
        STATUS_SUCCESS
    }

    fn write_block(&mut self, _host: &mut dyn SioHost, address: u16, length: u16) -> u8 {
        self.calls.lock().unwrap().push((true, address, length, None));
        STATUS_SUCCESS
    }
}

#[test]
fn cassette_blocks() {
    let mut bus = accel_bus();
    let tape = Tape::default();
    bus.sio.set_cassette(Some(Box::new(tape.clone())));

    let mut host = host_with_request(CASSETTE_DEVICE, 0x52, MODE_READ, 128, [0, 0]);
    assert_eq!(bus.sio.on_serial_hook(&mut host, HOOK_PC), RTS);
    assert_eq!(host.y(), STATUS_SUCCESS);
    assert_eq!(host.mem_read_byte(BUFFER), 0x55);
    // The cassette keeps its own POKEY setup.
    assert_eq!(host.mem_read_byte(AUDF3), 0);

    let mut host = host_with_request(CASSETTE_DEVICE, 0x57, MODE_WRITE, 128, [0, 0]);
    assert_eq!(bus.sio.on_serial_hook(&mut host, HOOK_PC), RTS);

    let calls = tape.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 2);
    let (write, address, length, timeout) = calls[0];
    assert!(!write);
    assert_eq!((address, length), (BUFFER, 128));
    let expected = 7.0 * 64.0 * NTSC_CYCLES_PER_FRAME as f64 / MASTER_CLOCK_HZ;
    assert!((timeout.unwrap() as f64 - expected).abs() < 0.01);
    assert!(calls[1].0);
}

#[test]
fn cassette_needs_patch() {
    let config = SioConfig { cassette_patch_enabled: false, ..SioConfig::accelerated() };
    let mut bus = Bus::with_config(config);
    bus.sio.set_cassette(Some(Box::new(Tape::default())));

    let mut host = host_with_request(CASSETTE_DEVICE, 0x52, MODE_READ, 128, [0, 0]);
    assert_eq!(bus.sio.on_serial_hook(&mut host, HOOK_PC), 0);
}

#[test]
fn pbi_entry() {
    let mut bus = accel_bus();
    bus.add_scripted(status_device());

    let mut host = status_request();
    host.mem_write_byte(CRITIC, 1);
    bus.sio.try_accel_pbi_request(true, &mut host);
    assert!(host.get_status().get_carry());
    assert_eq!(host.mem_read_byte(CRITIC), 1);
    assert_eq!(host.read(BUFFER, 4), STATUS_DATA);

    let mut host = status_request();
    host.get_status_mut().set_carry(true);
    bus.sio.try_accel_pbi_request(false, &mut host);
    assert!(!host.get_status().get_carry());
    assert_eq!(host.mem_read_byte(STATUS), 0);
}

#[test]
fn non_pbi_clears_critic() {
    let mut bus = accel_bus();
    bus.add_scripted(status_device());

    let mut host = status_request();
    host.mem_write_byte(CRITIC, 1);
    bus.sio.on_serial_hook(&mut host, HOOK_PC);
    assert_eq!(host.mem_read_byte(CRITIC), 0);
}
