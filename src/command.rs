use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Opcode prefix of the set power/mode command
pub const SET_POWER_OPCODE: [u8; 2] = [0xE9, 0x02];

/// Opcode prefix of the set test mode command
pub const SET_TEST_MODE_OPCODE: [u8; 2] = [0xE8, 0x02];

/// Highest mode index understood by the set power command
pub const MAX_POWER_MODE: u8 = 10;

/// Commands accepted on the write characteristic, before encryption
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Set output power mode and voltage
    SetPower {
        /// Mode index, 0 to [`MAX_POWER_MODE`]
        mode: u8,
        /// Voltage (V), sent in hundredths
        voltage: f64,
    },
    /// Switch the monitor's test mode
    SetTestMode {
        /// Test selector
        test: u8,
        /// Option of test 3
        option: u8,
    },
}

impl Command {
    /// Serialize the command to its plaintext payload
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        match *self {
            Self::SetPower { mode, voltage } => {
                let value = centivolts(voltage);
                let mut buf = BytesMut::with_capacity(3 + 8);
                buf.extend_from_slice(&SET_POWER_OPCODE);
                buf.put_u8(power_mode_byte(mode));
                buf.extend_from_slice(&minimal_be_bytes(value));
                buf.freeze()
            }
            Self::SetTestMode { test, option } => {
                let (b2, b3) = test_mode_bytes(test, option);
                let mut buf = BytesMut::with_capacity(4);
                buf.extend_from_slice(&SET_TEST_MODE_OPCODE);
                buf.put_u8(b2);
                buf.put_u8(b3);
                buf.freeze()
            }
        }
    }
}

/// Mode indices run opposite to the firmware's; unknown indices map to 0
#[must_use]
pub const fn power_mode_byte(mode: u8) -> u8 {
    if mode <= MAX_POWER_MODE {
        MAX_POWER_MODE - mode
    } else {
        0
    }
}

/// Selector bytes of the set test mode command
#[must_use]
pub const fn test_mode_bytes(test: u8, option: u8) -> (u8, u8) {
    match test {
        2 => (2, 0),
        3 => (3, if option <= 2 { option } else { 0 }),
        _ => (1, 0),
    }
}

/// Voltage in hundredths, rounded. Negative and NaN inputs become 0.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn centivolts(voltage: f64) -> u64 {
    (voltage * 100.0).round() as u64
}

/// Big-endian bytes without leading zeros; zero is a single zero byte
#[must_use]
pub fn minimal_be_bytes(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let first = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len() - 1);
    bytes[first..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_power_message() {
        let cmd = Command::SetPower {
            mode: 3,
            voltage: 12.34,
        };
        assert_eq!(&cmd.to_bytes()[..], &[0xE9, 0x02, 7, 0x04, 0xD2]);
    }

    #[test]
    fn test_set_power_zero_voltage() {
        let cmd = Command::SetPower {
            mode: 0,
            voltage: 0.0,
        };
        assert_eq!(&cmd.to_bytes()[..], &[0xE9, 0x02, 10, 0x00]);
    }

    #[test]
    fn test_set_power_saturates_negative_voltage() {
        let cmd = Command::SetPower {
            mode: 10,
            voltage: -5.0,
        };
        assert_eq!(&cmd.to_bytes()[..], &[0xE9, 0x02, 0, 0x00]);
    }

    #[test]
    fn test_power_mode_table() {
        let expected = [10, 9, 8, 7, 6, 5, 4, 3, 2, 1, 0];
        for (mode, byte) in expected.iter().enumerate() {
            assert_eq!(power_mode_byte(mode as u8), *byte);
        }
        assert_eq!(power_mode_byte(11), 0);
        assert_eq!(power_mode_byte(255), 0);
    }

    #[test]
    fn test_minimal_be_bytes() {
        assert_eq!(minimal_be_bytes(0), vec![0]);
        assert_eq!(minimal_be_bytes(0xFF), vec![0xFF]);
        assert_eq!(minimal_be_bytes(0x100), vec![0x01, 0x00]);
        assert_eq!(minimal_be_bytes(1234), vec![0x04, 0xD2]);
        assert_eq!(minimal_be_bytes(0x01_0000), vec![0x01, 0x00, 0x00]);
    }

    #[test]
    fn test_set_test_mode_message() {
        let cases = [
            ((2, 9), [0xE8, 0x02, 2, 0]),
            ((3, 0), [0xE8, 0x02, 3, 0]),
            ((3, 1), [0xE8, 0x02, 3, 1]),
            ((3, 2), [0xE8, 0x02, 3, 2]),
            ((3, 7), [0xE8, 0x02, 3, 0]),
            ((1, 5), [0xE8, 0x02, 1, 0]),
            ((0, 0), [0xE8, 0x02, 1, 0]),
        ];

        for ((test, option), expected) in cases {
            let bytes = Command::SetTestMode { test, option }.to_bytes();
            assert_eq!(&bytes[..], &expected, "test={test} option={option}");
        }
    }
}
