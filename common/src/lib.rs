pub mod checksum;
pub mod command;
pub mod constants;
pub mod dcb;
pub mod decoder;
