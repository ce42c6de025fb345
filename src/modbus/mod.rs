pub mod client;
pub mod crc;
pub mod protocol;
pub mod simulator;
pub mod transport;

pub use client::{ClientSettings, RegisterClient, RetryPolicy};
pub use crc::crc16_modbus;
pub use protocol::{ModbusRequest, ModbusResponse};
pub use simulator::{Injection, SimulatedDrive, SimulatorControls};
pub use transport::{SerialTransport, Transport};
