/// CRC-16/MODBUS over `data`. Appended to frames low byte first.
pub fn crc16_modbus(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    let poly: u16 = 0xA001;

    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ poly;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Checks the trailing little-endian CRC of a complete RTU frame.
/// Returns `(expected, received)` on mismatch.
pub fn verify_frame_crc(frame: &[u8]) -> Result<(), (u16, u16)> {
    if frame.len() < 3 {
        return Err((0, 0));
    }
    let data_len = frame.len() - 2;
    let received = u16::from_le_bytes([frame[data_len], frame[data_len + 1]]);
    let expected = crc16_modbus(&frame[..data_len]);
    if received == expected {
        Ok(())
    } else {
        Err((expected, received))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_modbus_known_frame() {
        // Read one holding register at 0 from slave 1: 01 03 00 00 00 01 84 0A
        let data = [0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        assert_eq!(crc16_modbus(&data), 0x0A84);
    }

    #[test]
    fn test_verify_frame_crc() {
        let frame = [0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A];
        assert!(verify_frame_crc(&frame).is_ok());

        let corrupted = [0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0x84, 0x0A];
        assert!(verify_frame_crc(&corrupted).is_err());
    }
}
