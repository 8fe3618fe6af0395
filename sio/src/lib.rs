pub mod config;
pub mod device;
pub mod devices;
pub mod error;
pub mod host;
pub mod interface;
pub mod manager;
pub mod port;
pub mod raw;
pub mod save_state;
pub mod scheduler;
pub mod step;
pub mod transfer;

mod accel;

pub use config::SioConfig;
pub use device::{SioDevice, SioRawDevice};
pub use error::{SaveStateError, SioError};
pub use host::{HostState, SioHost, Status};
pub use interface::{CommandPhase, InterfaceId, SioInterface};
pub use manager::{CassetteBlockIo, SioManager};
pub use port::{PipePort, SerialByte, SioPort};
pub use raw::{RawBus, RawDeviceId};
