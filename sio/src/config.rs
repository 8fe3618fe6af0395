use common::constants::DEFAULT_FAST_BOOT_POLL_RETRIES;

/// User facing switches. Everything is off by default, i.e. the bus runs in true
/// (cycle accurate) mode only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SioConfig {
    /// Master switch for intercepting the OS serial routine.
    pub sio_patch_enabled: bool,

    pub disk_accel_enabled: bool,
    pub other_accel_enabled: bool,

    /// Allow bursting on disk transfers; `burst_enabled` covers everything else.
    pub disk_burst_enabled: bool,
    pub burst_enabled: bool,

    /// Time out the kernel's boot probe of absent devices.
    pub fast_boot_enabled: bool,
    pub cassette_patch_enabled: bool,

    /// Don't accelerate a disk until it has been spoken to over the bus once.
    pub disk_override_detect_enabled: bool,

    /// Always accelerate this device, regardless of the accel switches. 0 means none.
    pub debugger_device_id: u8,

    pub fast_boot_poll_retries: u8,
}

impl Default for SioConfig {
    fn default() -> Self {
        SioConfig {
            sio_patch_enabled: false,
            disk_accel_enabled: false,
            other_accel_enabled: false,
            disk_burst_enabled: false,
            burst_enabled: false,
            fast_boot_enabled: false,
            cassette_patch_enabled: false,
            disk_override_detect_enabled: false,
            debugger_device_id: 0,
            fast_boot_poll_retries: DEFAULT_FAST_BOOT_POLL_RETRIES,
        }
    }
}

impl SioConfig {
    /// Turn on every acceleration path.
    pub fn accelerated() -> Self {
        SioConfig {
            sio_patch_enabled: true,
            disk_accel_enabled: true,
            other_accel_enabled: true,
            fast_boot_enabled: true,
            cassette_patch_enabled: true,
            ..Default::default()
        }
    }

    /// Whether the OS serial routine should be intercepted at all.
    pub fn wants_serial_hook(&self) -> bool {
        if !self.sio_patch_enabled && self.debugger_device_id == 0 {
            return false;
        }

        self.other_accel_enabled
            || self.disk_accel_enabled
            || self.cassette_patch_enabled
            || self.fast_boot_enabled
            || self.debugger_device_id != 0
    }
}
