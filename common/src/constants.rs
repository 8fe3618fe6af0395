// Timing. All times are in machine cycles of the 1.79MHz bus clock.

pub const MASTER_CLOCK_HZ: f64 = 1_789_772.5;
pub const NTSC_CYCLES_PER_FRAME: u32 = 29_868;

pub const BITS_PER_BYTE: u32 = 10; // Start, 8 data, stop.
pub const DEFAULT_CYCLES_PER_BIT: u32 = 93; // ~19200 baud
pub const DEFAULT_CYCLES_PER_BYTE: u32 = 932;

// Inclusive range of rates the stock kernel and drives consider "standard".
pub const STANDARD_RATE_MIN: u32 = 91;
pub const STANDARD_RATE_MAX: u32 = 98;

pub const COMMAND_FRAME_LEN: usize = 5;
pub const MAX_TRANSFER_SIZE: usize = 65536;

// Device must wait at least 250us before sending Complete/Error.
pub const REPLY_DELAY_TICKS: u32 = 450;
// At least 850us between the end of the data frame and the ACK/NAK.
pub const RECEIVE_REPLY_DELAY_TICKS: u32 = 1530;

// Charged to an accelerated command for the frame it never actually sent.
pub const ACCEL_COMMAND_FRAME_SKEW: u32 = 2685 + 940 * 5 + 1040;

// Burst transfers collapse the inter-byte gap once this many bytes went out.
pub const BURST_MIN_BYTES: u32 = 3;
pub const BURST_BYTE_DELAY: u32 = 50;

pub const DEFAULT_FAST_BOOT_POLL_RETRIES: u8 = 26;

// Persisted rate sanity limits.
pub const MAX_SAVED_CYCLES_PER_BIT: u32 = 100_000;
pub const MAX_SAVED_CYCLES_PER_BYTE: u32 = 1_000_000;

// Reply bytes.
pub const ACK: u8 = b'A';
pub const NAK: u8 = b'N';
pub const COMPLETE: u8 = b'C';
pub const ERROR: u8 = b'E';

// Request status codes, as left in DSTATS and Y.
pub const STATUS_SUCCESS: u8 = 0x01;
pub const STATUS_TIMEOUT: u8 = 0x8A;
pub const STATUS_NAK: u8 = 0x8B;
pub const STATUS_CHECKSUM: u8 = 0x8F;
pub const STATUS_DEVICE_ERROR: u8 = 0x90;

// DSTATS direction bits.
pub const MODE_READ: u8 = 0x40; // Device to memory
pub const MODE_WRITE: u8 = 0x80; // Memory to device

// Device IDs.
pub const DISK_FIRST: u8 = 0x31;
pub const DISK_LAST: u8 = 0x3F;
pub const DISK_COUNT: u8 = DISK_LAST - DISK_FIRST + 1;
pub const FAST_BOOT_DEVICE: u8 = 0x4F; // Type 3 poll target probed by the kernel at boot
pub const CASSETTE_DEVICE: u8 = 0x5F;

pub const POLL_COMMAND: u8 = 0x40;
pub const GET_STATUS_COMMAND: u8 = 0x53;
pub const READ_SECTOR_COMMAND: u8 = 0x52;

// 6502 processor status bits.
pub const FLAG_C: u8 = 0x01;
pub const FLAG_Z: u8 = 0x02;
pub const FLAG_I: u8 = 0x04;
pub const FLAG_N: u8 = 0x80;

// OS kernel database.
pub const BRKKEY: u16 = 0x0011;
pub const STATUS: u16 = 0x0030;
pub const CHKSUM: u16 = 0x0031;
pub const BUFRLO: u16 = 0x0032;
pub const BUFRHI: u16 = 0x0033;
pub const CHKSNT: u16 = 0x003B;
pub const CRITIC: u16 = 0x0042;
pub const CDTMA1: u16 = 0x0226;
pub const SSKCTL: u16 = 0x0232;
pub const DDEVIC: u16 = 0x0300;
pub const DSTATS: u16 = 0x0303;
pub const TIMFLG: u16 = 0x0317;

pub const CDTMA1_DEFAULT: u16 = 0xE4C0;

// POKEY.
pub const AUDF3: u16 = 0xD204;
pub const AUDF4: u16 = 0xD206;
pub const SKCTL: u16 = 0xD20F;

// Restored after an accelerated request: 19200 baud, async receive.
pub const AUDF3_DEFAULT: u8 = 0x28;
pub const AUDF4_DEFAULT: u8 = 0x00;
pub const SKCTL_DEFAULT: u8 = 0x13;
