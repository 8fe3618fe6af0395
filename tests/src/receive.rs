use crate::bus::*;

use sio_lib::devices::{LogEntry, Reply, ScriptedDevice};
use sio_lib::{SioDevice, SioInterface};

use common::checksum::compute_checksum;
use common::command::{CmdResponse, SioCommand};
use common::constants::*;

use std::sync::{Arc, Mutex};

const WRITE_COMMAND: u8 = 0x57;
const PAYLOAD: [u8; 4] = [0xde, 0xad, 0xbe, 0xef];

fn writer() -> ScriptedDevice {
    let reply = Reply::Receive { len: PAYLOAD.len() as u32 };
    ScriptedDevice::new(0x50).with_reply(WRITE_COMMAND, reply)
}

// Frame, then wait out the ACK so the receive is up.
fn start_write(bus: &mut Bus) {
    bus.command(0x50, WRITE_COMMAND, 0, 0);
    let ack_done = bus.sio.tick64() + DEFAULT_CYCLES_PER_BYTE as u64;
    bus.run_until(ack_done);
}

fn with_checksum(data: &[u8]) -> Vec<u8> {
    let mut frame = data.to_vec();
    frame.push(compute_checksum(data));
    frame
}

#[test]
fn good_data_frame() {
    let mut bus = Bus::new();
    let (id, log) = bus.add_scripted(writer());

    start_write(&mut bus);
    bus.send_bytes(&with_checksum(&PAYLOAD));
    let data_end = bus.sio.tick64();
    bus.run_idle();

    let bytes = bus.received();
    assert_eq!(bytes.iter().map(|b| b.value).collect::<Vec<_>>(), [ACK, ACK, COMPLETE]);
    assert_eq!(bytes[1].time, data_end + RECEIVE_REPLY_DELAY_TICKS as u64);
    assert_eq!(
        bytes[2].time,
        bytes[1].time + (DEFAULT_CYCLES_PER_BYTE + REPLY_DELAY_TICKS) as u64
    );

    let entries = log.entries();
    assert_eq!(
        entries[1],
        LogEntry::ReceiveComplete {
            id: ScriptedDevice::RECEIVE_ID,
            data: PAYLOAD.to_vec(),
            checksum_ok: true,
        }
    );
    assert!(!bus.sio.is_command_active(id));
}

#[test]
fn bad_checksum_naked() {
    let mut bus = Bus::new();
    let (id, log) = bus.add_scripted(writer());

    start_write(&mut bus);
    let mut frame = with_checksum(&PAYLOAD);
    frame[4] ^= 0xff;
    bus.send_bytes(&frame);
    bus.run_idle();

    assert_eq!(bus.values(), [ACK, NAK]);
    assert_eq!(log.entries().len(), 1);
    assert!(!bus.sio.is_command_active(id));
}

#[test]
fn wrong_bit_rate_naked() {
    let mut bus = Bus::new();
    bus.add_scripted(writer());

    start_write(&mut bus);
    bus.cycles_per_bit = 80;
    bus.send_bytes(&with_checksum(&PAYLOAD));
    bus.run_idle();

    assert_eq!(bus.values(), [ACK, NAK]);
}

#[test]
fn bytes_outside_receive_ignored() {
    let mut bus = Bus::new();
    let (_, log) = bus.add_scripted(writer());

    // Still sending the ACK.
    bus.command(0x50, WRITE_COMMAND, 0, 0);
    bus.send_byte(0x11, false);
    assert_eq!(log.entries().len(), 1);
}

////////////////////////////////////////////////////////////////////////////////

#[derive(Default)]
struct RawReceiver {
    got: Arc<Mutex<Vec<(Vec<u8>, bool)>>>,
}

impl SioDevice for RawReceiver {
    fn on_begin_command(&mut self, _cmd: &SioCommand, iface: &mut SioInterface<'_>) -> CmdResponse {
        iface.begin_command();
        iface.receive_data(0, 0, false);
        iface.receive_data(1, 2, false);
        CmdResponse::Start
    }

    fn on_receive_complete(
        &mut self,
        _id: u32,
        data: &[u8],
        checksum_ok: bool,
        iface: &mut SioInterface<'_>,
    ) {
        self.got.lock().unwrap().push((data.to_vec(), checksum_ok));
        if data.len() == 2 {
            iface.end_command();
        }
    }
}

#[test]
fn plain_receives() {
    let mut bus = Bus::new();
    let dev = RawReceiver::default();
    let got = dev.got.clone();
    let id = bus.add(dev);

    bus.command(0x70, 0x01, 0, 0);
    // The empty one completes right away.
    assert_eq!(*got.lock().unwrap(), [(vec![], true)]);

    // Plain receives check the trailing byte as a checksum.
    bus.send_bytes(&[0x05, 0x05]);
    bus.run_idle();

    assert_eq!(got.lock().unwrap()[1], (vec![0x05, 0x05], true));
    assert!(!bus.sio.is_command_active(id));
}

////////////////////////////////////////////////////////////////////////////////

fn long_status() -> ScriptedDevice {
    ScriptedDevice::new(0x31).with_reply(GET_STATUS_COMMAND, Reply::Data(vec![0x55; 64]))
}

#[test]
fn truncation() {
    let mut bus = Bus::new();
    let (id, log) = bus.add_scripted(long_status());
    bus.sio.with_interface(id, |iface| iface.set_command_truncation_enabled(true));

    bus.command(0x31, GET_STATUS_COMMAND, 0, 0);
    bus.run_until(20_000);
    assert!(bus.sio.is_command_active(id));

    bus.command(0x31, GET_STATUS_COMMAND, 0, 0);

    assert!(matches!(
        log.entries()[..],
        [LogEntry::Command(_), LogEntry::Abort, LogEntry::Command(_)]
    ));
}

#[test]
fn no_truncation_by_default() {
    let mut bus = Bus::new();
    let (id, log) = bus.add_scripted(long_status());

    bus.command(0x31, GET_STATUS_COMMAND, 0, 0);
    bus.run_until(20_000);
    bus.command(0x31, GET_STATUS_COMMAND, 0, 0);

    assert!(matches!(log.entries()[..], [LogEntry::Command(_)]));
    assert!(bus.sio.is_command_active(id));
}
