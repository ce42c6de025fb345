pub mod motor;
pub mod registers;
pub mod sample;
pub mod status;

pub use motor::{Command, ControlWords, FaultCode, MotorModel, MotorState, OperatingMode, RegisterWrite};
pub use registers::{Register, RegisterAddress, POLL_SET};
pub use sample::RawSample;
pub use status::{ModeClass, StatusDecodeTable, StatusRule};
