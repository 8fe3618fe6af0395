use crate::bus::*;

use sio_lib::devices::{Reply, ScriptedDevice};
use sio_lib::SioConfig;

use common::checksum::compute_checksum;
use common::constants::*;

const BYTE: u64 = DEFAULT_CYCLES_PER_BYTE as u64;
const FRAME_END: u64 = 5 * BYTE;

fn burst_config() -> SioConfig {
    SioConfig { burst_enabled: true, ..Default::default() }
}

fn printer() -> ScriptedDevice {
    ScriptedDevice::new(0x50).with_reply(0x52, Reply::Data(vec![0x20; 16]))
}

#[test]
fn burst_shortens_byte_gap() {
    let mut bus = Bus::with_config(burst_config());
    let (id, _) = bus.add_scripted(printer());

    bus.command(0x50, 0x52, 0, 0);

    // ACK, gap, Complete, then three data bytes.
    let third = FRAME_END + BYTE + REPLY_DELAY_TICKS as u64 + 3 * BYTE;
    bus.run_until(third);
    assert_eq!(bus.received().len(), 5);

    bus.sio.on_ser_in_ready();
    assert_eq!(bus.sio.next_event_tick(), Some(third + BURST_BYTE_DELAY as u64));

    bus.run_until(third + BURST_BYTE_DELAY as u64);
    let bytes = bus.received();
    assert_eq!(bytes.len(), 1);
    assert_eq!(bytes[0].time, third + BURST_BYTE_DELAY as u64);
    assert!(bytes[0].allow_burst);

    // The time saved goes onto the next byte, so the transfer still ends on time.
    let saved = BYTE - BURST_BYTE_DELAY as u64;
    assert_eq!(bus.sio.accel_time_skew(id), saved as u32);
    assert_eq!(bus.sio.next_event_tick(), Some(third + 2 * BYTE));
}

#[test]
fn no_burst_before_three_bytes() {
    let mut bus = Bus::with_config(burst_config());
    bus.add_scripted(printer());

    bus.command(0x50, 0x52, 0, 0);
    bus.sio.on_ser_in_ready();

    assert_eq!(bus.sio.next_event_tick(), Some(FRAME_END + BYTE));
}

#[test]
fn burst_flags_follow_config() {
    let mut bus = Bus::new();
    bus.add_scripted(printer());
    bus.command(0x50, 0x52, 0, 0);
    bus.run_idle();
    assert!(bus.received().iter().all(|b| !b.allow_burst));

    // Disks go by their own switch.
    let mut bus = Bus::with_config(burst_config());
    bus.add_scripted(status_device());
    bus.command(0x31, GET_STATUS_COMMAND, 0, 0);
    bus.run_idle();
    assert!(bus.received().iter().all(|b| !b.allow_burst));

    let mut bus = Bus::with_config(SioConfig { disk_burst_enabled: true, ..Default::default() });
    bus.add_scripted(status_device());
    bus.command(0x31, GET_STATUS_COMMAND, 0, 0);
    bus.run_idle();
    assert!(bus.received().iter().all(|b| b.allow_burst));
}

#[test]
fn receive_reports_burst() {
    let mut bus = Bus::with_config(burst_config());
    bus.add_scripted(ScriptedDevice::new(0x50).with_reply(0x57, Reply::Receive { len: 2 }));

    bus.command(0x50, 0x57, 0, 0);
    bus.run_until(FRAME_END + BYTE);

    let data = [0x01, 0x02];
    assert!(bus.send_byte(data[0], false));
    assert!(bus.send_byte(data[1], false));
    assert!(bus.send_byte(compute_checksum(&data), false));
}
