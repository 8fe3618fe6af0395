pub mod scripted;

pub use scripted::{DeviceLog, LogEntry, Reply, ScriptedDevice};
