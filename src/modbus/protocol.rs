//! Modbus RTU frames for the two function codes the drive needs.

use bytes::{BufMut, Bytes, BytesMut};

use super::crc::{crc16_modbus, verify_frame_crc};
use crate::devices::registers::RegisterAddress;
use crate::utils::error::FrameError;

pub const FN_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FN_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const EXCEPTION_FLAG: u8 = 0x80;

pub const EXCEPTION_ILLEGAL_FUNCTION: u8 = 0x01;
pub const EXCEPTION_ILLEGAL_ADDRESS: u8 = 0x02;
pub const EXCEPTION_ILLEGAL_VALUE: u8 = 0x03;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModbusRequest {
    ReadHoldingRegisters {
        slave: u8,
        start: RegisterAddress,
        quantity: u16,
    },
    WriteSingleRegister {
        slave: u8,
        address: RegisterAddress,
        value: u16,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModbusResponse {
    Registers(Vec<u16>),
    WriteAck { address: RegisterAddress, value: u16 },
}

fn seal(mut frame: BytesMut) -> Bytes {
    let crc = crc16_modbus(&frame);
    frame.put_u16_le(crc);
    frame.freeze()
}

impl ModbusRequest {
    pub fn slave(&self) -> u8 {
        match self {
            ModbusRequest::ReadHoldingRegisters { slave, .. }
            | ModbusRequest::WriteSingleRegister { slave, .. } => *slave,
        }
    }

    pub fn function_code(&self) -> u8 {
        match self {
            ModbusRequest::ReadHoldingRegisters { .. } => FN_READ_HOLDING_REGISTERS,
            ModbusRequest::WriteSingleRegister { .. } => FN_WRITE_SINGLE_REGISTER,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ModbusRequest::ReadHoldingRegisters { slave, start, quantity } => {
                format!("read {} registers from {} on slave {}", quantity, start, slave)
            }
            ModbusRequest::WriteSingleRegister { slave, address, value } => {
                format!("write 0x{:04x} to {} on slave {}", value, address, slave)
            }
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut frame = BytesMut::with_capacity(8);
        frame.put_u8(self.slave());
        frame.put_u8(self.function_code());
        match self {
            ModbusRequest::ReadHoldingRegisters { start, quantity, .. } => {
                frame.put_u16(start.0);
                frame.put_u16(*quantity);
            }
            ModbusRequest::WriteSingleRegister { address, value, .. } => {
                frame.put_u16(address.0);
                frame.put_u16(*value);
            }
        }
        seal(frame)
    }

    /// Validates a response frame against this request.
    pub fn decode_response(&self, frame: &[u8]) -> Result<ModbusResponse, FrameError> {
        if frame.len() < 5 {
            return Err(FrameError::TooShort(frame.len()));
        }
        verify_frame_crc(frame)
            .map_err(|(expected, received)| FrameError::CrcMismatch { expected, received })?;

        if frame[0] != self.slave() {
            return Err(FrameError::SlaveMismatch {
                expected: self.slave(),
                got: frame[0],
            });
        }

        let function = self.function_code();
        if frame[1] == function | EXCEPTION_FLAG {
            return Err(FrameError::Exception(frame[2]));
        }
        if frame[1] != function {
            return Err(FrameError::FunctionMismatch {
                expected: function,
                got: frame[1],
            });
        }

        match self {
            ModbusRequest::ReadHoldingRegisters { quantity, .. } => {
                let expected = *quantity as usize * 2;
                let byte_count = frame[2] as usize;
                if byte_count != expected || frame.len() != 5 + byte_count {
                    return Err(FrameError::ByteCountMismatch {
                        expected,
                        got: frame.len().saturating_sub(5),
                    });
                }
                let registers = frame[3..3 + byte_count]
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect();
                Ok(ModbusResponse::Registers(registers))
            }
            ModbusRequest::WriteSingleRegister { address, value, .. } => {
                if frame.len() != 8 {
                    return Err(FrameError::ByteCountMismatch {
                        expected: 8,
                        got: frame.len(),
                    });
                }
                let echoed_address = u16::from_be_bytes([frame[2], frame[3]]);
                let echoed_value = u16::from_be_bytes([frame[4], frame[5]]);
                if echoed_address != address.0 || echoed_value != *value {
                    return Err(FrameError::EchoMismatch);
                }
                Ok(ModbusResponse::WriteAck {
                    address: *address,
                    value: *value,
                })
            }
        }
    }

    /// Slave side: parses a request frame addressed to any slave.
    pub fn parse(frame: &[u8]) -> Result<ModbusRequest, FrameError> {
        if frame.len() != 8 {
            return Err(FrameError::TooShort(frame.len()));
        }
        verify_frame_crc(frame)
            .map_err(|(expected, received)| FrameError::CrcMismatch { expected, received })?;

        let slave = frame[0];
        let first = u16::from_be_bytes([frame[2], frame[3]]);
        let second = u16::from_be_bytes([frame[4], frame[5]]);
        match frame[1] {
            FN_READ_HOLDING_REGISTERS => Ok(ModbusRequest::ReadHoldingRegisters {
                slave,
                start: RegisterAddress(first),
                quantity: second,
            }),
            FN_WRITE_SINGLE_REGISTER => Ok(ModbusRequest::WriteSingleRegister {
                slave,
                address: RegisterAddress(first),
                value: second,
            }),
            other => Err(FrameError::FunctionMismatch {
                expected: FN_READ_HOLDING_REGISTERS,
                got: other,
            }),
        }
    }
}

/// Slave side: frames a successful read response.
pub fn encode_read_response(slave: u8, registers: &[u16]) -> Bytes {
    let mut frame = BytesMut::with_capacity(5 + registers.len() * 2);
    frame.put_u8(slave);
    frame.put_u8(FN_READ_HOLDING_REGISTERS);
    frame.put_u8((registers.len() * 2) as u8);
    for register in registers {
        frame.put_u16(*register);
    }
    seal(frame)
}

/// Slave side: frames an exception response.
pub fn encode_exception(slave: u8, function: u8, code: u8) -> Bytes {
    let mut frame = BytesMut::with_capacity(5);
    frame.put_u8(slave);
    frame.put_u8(function | EXCEPTION_FLAG);
    frame.put_u8(code);
    seal(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_request(quantity: u16) -> ModbusRequest {
        ModbusRequest::ReadHoldingRegisters {
            slave: 1,
            start: RegisterAddress(0),
            quantity,
        }
    }

    #[test]
    fn read_request_matches_reference_frame() {
        let frame = read_request(1).encode();
        assert_eq!(&frame[..], &[0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]);
    }

    #[test]
    fn read_response_decodes_big_endian_words() {
        let response = encode_read_response(1, &[0x1234, 0xFFCE]);
        assert_eq!(
            read_request(2).decode_response(&response),
            Ok(ModbusResponse::Registers(vec![0x1234, 0xFFCE]))
        );
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let mut response = encode_read_response(1, &[7]).to_vec();
        response[3] ^= 0xFF;
        assert!(matches!(
            read_request(1).decode_response(&response),
            Err(FrameError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn short_and_mis_sized_frames_are_rejected() {
        assert_eq!(
            read_request(1).decode_response(&[0x01, 0x03]),
            Err(FrameError::TooShort(2))
        );
        let response = encode_read_response(1, &[1, 2, 3]);
        assert!(matches!(
            read_request(2).decode_response(&response),
            Err(FrameError::ByteCountMismatch { expected: 4, .. })
        ));
    }

    #[test]
    fn wrong_slave_is_rejected() {
        let response = encode_read_response(9, &[1]);
        assert_eq!(
            read_request(1).decode_response(&response),
            Err(FrameError::SlaveMismatch { expected: 1, got: 9 })
        );
    }

    #[test]
    fn exception_response_surfaces_code() {
        let response = encode_exception(1, FN_READ_HOLDING_REGISTERS, EXCEPTION_ILLEGAL_ADDRESS);
        assert_eq!(
            read_request(1).decode_response(&response),
            Err(FrameError::Exception(EXCEPTION_ILLEGAL_ADDRESS))
        );
    }

    #[test]
    fn write_is_acknowledged_by_echo() {
        let request = ModbusRequest::WriteSingleRegister {
            slave: 2,
            address: RegisterAddress(0x63),
            value: 0x047F,
        };
        let echo = request.encode();
        assert!(matches!(
            request.decode_response(&echo),
            Ok(ModbusResponse::WriteAck { value: 0x047F, .. })
        ));
        assert_eq!(ModbusRequest::parse(&echo), Ok(request));
    }
}
