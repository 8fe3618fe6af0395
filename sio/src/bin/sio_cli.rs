use std::sync::Arc;

use sio_lib::devices::{Reply, ScriptedDevice};
use sio_lib::{HostState, PipePort, SioConfig, SioHost, SioManager};

use common::command::build_frame;
use common::constants::*;
use common::dcb::Dcb;

use clap::Parser;


/// Sends one command frame to a scripted device and prints the reply.
#[derive(Parser)]
struct Args {
    /// Device ID
    #[arg(long, default_value = "0x31", value_parser = parse_byte)]
    device: u8,

    /// Command byte
    #[arg(long, default_value = "0x53", value_parser = parse_byte)]
    command: u8,

    #[arg(long, default_value = "0", value_parser = parse_byte)]
    aux1: u8,

    #[arg(long, default_value = "0", value_parser = parse_byte)]
    aux2: u8,

    /// Bytes the device answers with, comma separated.
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "0x10,0x00,0xe0,0x00",
        value_parser = parse_byte
    )]
    data: Vec<u8>,

    /// Skip the bus and go through the OS call intercept.
    #[arg(long)]
    accel: bool,

    /// Let the device burst its data.
    #[arg(long)]
    burst: bool,
}

// Decimal, 0x hex or $ hex.
fn parse_byte(s: &str) -> Result<u8, String> {
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix('$')) {
        u8::from_str_radix(hex, 16)
    } else {
        s.parse::<u8>()
    };
    parsed.map_err(|e| format!("{s}: {e}"))
}

const BUFFER: u16 = 0x0600;

fn run_bus(sio: &mut SioManager, port: &PipePort, args: &Args) {
    let frame = build_frame(args.device, args.command, args.aux1, args.aux2);

    sio.begin_command_line();
    for byte in frame {
        sio.advance(DEFAULT_CYCLES_PER_BYTE as u64);
        let now = sio.tick64();
        sio.on_bus_byte(byte, true, DEFAULT_CYCLES_PER_BIT, now, false, false);
    }
    sio.end_command_line();

    while let Some(next) = sio.next_event_tick() {
        sio.run_until(next);
        if args.burst {
            sio.on_ser_in_ready();
        }
    }

    for byte in port.take_received() {
        println!("{:>8}  {:02X}", byte.time, byte.value);
    }
}

fn run_accel(sio: &mut SioManager, args: &Args) {
    let mut host = HostState::new();
    host.mem_write_byte(BRKKEY, 0xFF);

    let dcb = Dcb {
        ddevic: args.device,
        dunit: 1,
        dcomnd: args.command,
        dstats: MODE_READ,
        dbuf: BUFFER.to_le_bytes(),
        dtimlo: 7,
        dunuse: 0,
        dbyt: (args.data.len() as u16).to_le_bytes(),
        daux: [args.aux1, args.aux2],
    };
    host.load(&dcb.to_bytes(), Dcb::ADDR);

    if sio.on_serial_hook(&mut host, 0xE459) == 0 {
        println!("not handled");
        return;
    }

    println!("status {:02X} carry {}", host.y(), host.get_status().get_carry());
    println!("buffer {:02X?}", host.read(BUFFER, args.data.len()));
    println!("skew {}", sio.take_time_skew());
}

fn main() {
    env_logger::init();

    let args = Args::parse();

    let config = SioConfig {
        burst_enabled: args.burst,
        disk_burst_enabled: args.burst,
        ..SioConfig::accelerated()
    };

    let port = Arc::new(PipePort::default());
    let mut sio = SioManager::with_config(port.clone(), config);
    let reply = Reply::Data(args.data.clone());
    sio.add_device(Box::new(ScriptedDevice::new(args.device).with_reply(args.command, reply)));

    match args.accel {
        true => run_accel(&mut sio, &args),
        false => run_bus(&mut sio, &port, &args),
    }
}
