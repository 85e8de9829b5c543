use crate::{
    cipher::FrameCipher,
    error::{Bm2Error, Result},
    types::{ChargeTestResult, CrankTestResult, HistoryRecord, SessionState, VoltageStatus},
};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Prefix of every charge test payload
pub const CHARGE_TEST_MARKER: &str = "fefefe";

/// Terminator of the voltage sample list in crank test payloads
pub const CRANK_TEST_MARKER: &str = "fffefe";

/// Code carried by the bare charge test marker
pub const SPECIAL_NOTICE_CODE: u16 = 302;

/// Shortest payload, in hex characters, read as a voltage status
pub const VOLTAGE_STATUS_MIN_LEN: usize = 16;

/// Hex characters per history record
pub const HISTORY_RECORD_LEN: usize = 8;

/// Spacing between consecutive history records
pub const HISTORY_INTERVAL_MS: i64 = 120_000;

/// Seconds represented by one unit of a crank test base value
const CRANK_BASE_UNIT_S: i64 = 120;

/// Decoded notification from the monitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Bare charge test marker without a result
    SpecialNotice {
        /// Notice code, always [`SPECIAL_NOTICE_CODE`]
        code: u16,
    },
    /// Charge test result
    ChargeTest(ChargeTestResult),
    /// Crank test result
    CrankTest(CrankTestResult),
    /// Periodic voltage report
    VoltageStatus(VoltageStatus),
    /// Batch of history records, oldest first.
    ///
    /// Never produced by [`route`]; built by [`decode_history`] when the caller
    /// has requested history.
    History(Vec<HistoryRecord>),
    /// Payload matched no known layout
    Unrecognized,
}

/// Payload layout picked by [`classify`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Starts with [`CHARGE_TEST_MARKER`]
    ChargeTest,
    /// Contains [`CRANK_TEST_MARKER`]
    CrankTest,
    /// At least [`VOLTAGE_STATUS_MIN_LEN`] characters long
    VoltageStatus,
    /// None of the above
    Unrecognized,
}

struct RouteRule {
    kind: FrameKind,
    matches: fn(&str) -> bool,
}

fn starts_with_charge_marker(hex: &str) -> bool {
    hex.starts_with(CHARGE_TEST_MARKER)
}

fn contains_crank_marker(hex: &str) -> bool {
    hex.contains(CRANK_TEST_MARKER)
}

fn is_voltage_status_len(hex: &str) -> bool {
    hex.len() >= VOLTAGE_STATUS_MIN_LEN
}

/// Evaluated in order, first match wins
const ROUTES: [RouteRule; 3] = [
    RouteRule {
        kind: FrameKind::ChargeTest,
        matches: starts_with_charge_marker,
    },
    RouteRule {
        kind: FrameKind::CrankTest,
        matches: contains_crank_marker,
    },
    RouteRule {
        kind: FrameKind::VoltageStatus,
        matches: is_voltage_status_len,
    },
];

/// Pick the payload layout of a decrypted hex string
#[must_use]
pub fn classify(hex: &str) -> FrameKind {
    ROUTES
        .iter()
        .find(|rule| (rule.matches)(hex))
        .map_or(FrameKind::Unrecognized, |rule| rule.kind)
}

/// Classify a decrypted payload and run the matching parser.
///
/// Voltage status updates `state`; crank tests read it.
///
/// # Errors
///
/// Returns [`Bm2Error::ParseError`] if the payload is too short for its layout
/// or a field is not hexadecimal.
pub fn route(hex: &str, state: &mut SessionState, now_ms: i64) -> Result<Message> {
    match classify(hex) {
        FrameKind::ChargeTest => {
            if is_special_notice(hex) {
                Ok(Message::SpecialNotice {
                    code: SPECIAL_NOTICE_CODE,
                })
            } else {
                parse_charge_test(hex).map(Message::ChargeTest)
            }
        }
        FrameKind::CrankTest => parse_crank_test(hex, state, now_ms).map(Message::CrankTest),
        FrameKind::VoltageStatus => parse_voltage_status(hex, state).map(Message::VoltageStatus),
        FrameKind::Unrecognized => Ok(Message::Unrecognized),
    }
}

/// Decrypt a raw notification and route it
///
/// # Errors
///
/// Returns [`Bm2Error::ParseError`] if the decrypted payload cannot be parsed.
pub fn decode_frame(
    cipher: &FrameCipher,
    frame: &[u8],
    state: &mut SessionState,
    now_ms: i64,
) -> Result<Message> {
    let hex = hex::encode(cipher.decrypt(frame));
    debug!("Decrypted payload: {hex}");
    route(&hex, state, now_ms)
}

/// Whether a charge test payload carries nothing after the marker but padding
fn is_special_notice(hex: &str) -> bool {
    hex.strip_prefix(CHARGE_TEST_MARKER)
        .is_some_and(|rest| rest.bytes().all(|b| b == b'0'))
}

/// Parse a charge test payload
///
/// # Errors
///
/// Returns [`Bm2Error::ParseError`] if the payload is shorter than 8 characters
/// or contains non-hex digits. A truncated high voltage field is read as far
/// as it goes.
pub fn parse_charge_test(hex: &str) -> Result<ChargeTestResult> {
    Ok(ChargeTestResult {
        status: field(hex, 2, 4)?,
        idle_volt: centi(hex, 4, 7)?,
        high_volt: centi(hex, 7, 10)?,
    })
}

/// Parse a voltage status payload and remember its timers in `state`
///
/// # Errors
///
/// Returns [`Bm2Error::ParseError`] if the payload is shorter than
/// [`VOLTAGE_STATUS_MIN_LEN`] or contains non-hex digits. `state` is left
/// untouched on error.
pub fn parse_voltage_status(hex: &str, state: &mut SessionState) -> Result<VoltageStatus> {
    if hex.len() < VOLTAGE_STATUS_MIN_LEN {
        return Err(Bm2Error::ParseError(format!(
            "Voltage status too short: {} characters, expected {VOLTAGE_STATUS_MIN_LEN}",
            hex.len()
        )));
    }

    let status = VoltageStatus {
        voltage: centi(hex, 2, 5)?,
        status: field(hex, 5, 6)?,
        battery_power: field(hex, 6, 8)?,
        time_b: field(hex, 8, 12)?,
        time_c: field(hex, 12, 16)?,
    };
    state.record(&status);

    Ok(status)
}

/// Parse a crank test payload.
///
/// Payload layout:
/// - `[4:8]`: base value, in two-minute units since the test
/// - `[8:11]`: voltage, centivolts
/// - `[11:12]`: status
/// - `[12:marker]`: voltage samples, three characters each, up to [`CRANK_TEST_MARKER`]
///
/// The test time is estimated from the base value and the timers of the
/// last voltage status held in `state`.
///
/// # Errors
///
/// Returns [`Bm2Error::ParseError`] if the payload is shorter than 12 characters
/// or contains non-hex digits.
pub fn parse_crank_test(hex: &str, state: &SessionState, now_ms: i64) -> Result<CrankTestResult> {
    let base_value = field(hex, 4, 8)?;
    let voltage = centi(hex, 8, 11)?;
    let status = field(hex, 11, 12)?;

    let tail_end = hex.find(CRANK_TEST_MARKER).unwrap_or(hex.len()).max(12);
    let tail = hex.get(12..tail_end).unwrap_or_default();
    let voltages = (0..tail.len() / 3)
        .map(|i| centi(tail, i * 3, i * 3 + 3))
        .collect::<Result<Vec<_>>>()?;

    let elapsed_s = crank_elapsed_seconds(base_value, state).max(0);

    Ok(CrankTestResult {
        base_value,
        voltage,
        status,
        voltages,
        test_time_ms: now_ms - elapsed_s * 1000,
    })
}

/// Seconds between a crank test and now.
///
/// Timers above 120 s are treated as unreliable and only the base value counts.
#[must_use]
pub fn crank_elapsed_seconds(base_value: u32, state: &SessionState) -> i64 {
    let base = i64::from(base_value) * CRANK_BASE_UNIT_S;
    let time_b = i64::from(state.last_time_b);
    let time_c = i64::from(state.last_time_c);

    if time_b > CRANK_BASE_UNIT_S || time_c > CRANK_BASE_UNIT_S {
        base
    } else {
        base - time_c + time_b
    }
}

/// Parse a history payload into records, oldest first.
///
/// The payload stores the newest record first; the newest record is stamped
/// `reference_time_ms` and each older one two minutes earlier. Trailing
/// characters that do not fill a whole record are ignored.
///
/// # Errors
///
/// Returns [`Bm2Error::ParseError`] if a record contains non-hex digits.
pub fn parse_history(hex: &str, reference_time_ms: i64) -> Result<Vec<HistoryRecord>> {
    let count = hex.len() / HISTORY_RECORD_LEN;

    (0..count)
        .map(|i| {
            let age = count - 1 - i;
            let start = age * HISTORY_RECORD_LEN;
            let chunk = hex
                .get(start..start + HISTORY_RECORD_LEN)
                .ok_or_else(|| Bm2Error::ParseError(format!("Bad history record at {start}")))?;

            Ok(HistoryRecord {
                voltage: centi(chunk, 0, 3)?,
                record_type: field(chunk, 7, 8)?,
                time_ms: reference_time_ms - age as i64 * HISTORY_INTERVAL_MS,
            })
        })
        .collect()
}

/// Parse a history payload into a [`Message::History`]
///
/// # Errors
///
/// Returns [`Bm2Error::ParseError`] if a record contains non-hex digits.
pub fn decode_history(hex: &str, reference_time_ms: i64) -> Result<Message> {
    parse_history(hex, reference_time_ms).map(Message::History)
}

/// Current wall clock time in Unix milliseconds
#[must_use]
pub fn unix_time_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
}

/// Read `hex[start..end]` as an unsigned hex number.
///
/// A range running past the end of the payload is cut short; only an empty
/// field is an error.
fn field(hex: &str, start: usize, end: usize) -> Result<u32> {
    let digits = hex
        .get(start..end.min(hex.len()))
        .filter(|digits| !digits.is_empty())
        .ok_or_else(|| {
            Bm2Error::ParseError(format!(
                "Payload too short for [{start}:{end}]: {} characters",
                hex.len()
            ))
        })?;

    if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Bm2Error::ParseError(format!("Not a hex field: {digits:?}")));
    }

    u32::from_str_radix(digits, 16)
        .map_err(|e| Bm2Error::ParseError(format!("Bad hex field {digits:?}: {e}")))
}

/// Read a field in hundredths
fn centi(hex: &str, start: usize, end: usize) -> Result<f64> {
    Ok(f64::from(field(hex, start, end)?) / 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::encrypt;

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn test_classify_precedence() {
        assert_eq!(classify("fefefe"), FrameKind::ChargeTest);
        assert_eq!(classify("fefefe0fffefe0aa"), FrameKind::ChargeTest);
        assert_eq!(classify("00fffefe"), FrameKind::CrankTest);
        assert_eq!(classify("0000000000fffefe0000"), FrameKind::CrankTest);
        assert_eq!(classify("004d80640032001e"), FrameKind::VoltageStatus);
        assert_eq!(classify("004d8064"), FrameKind::Unrecognized);
        assert_eq!(classify(""), FrameKind::Unrecognized);
    }

    #[test]
    fn test_special_notice() {
        let mut state = SessionState::default();
        assert_eq!(
            route("fefefe", &mut state, 0).unwrap(),
            Message::SpecialNotice { code: 302 }
        );
        assert_eq!(
            route("fefefe00000000000000000000000000", &mut state, 0).unwrap(),
            Message::SpecialNotice { code: 302 }
        );
    }

    #[test]
    fn test_charge_marker_wins_over_crank_marker() {
        let mut state = SessionState::default();
        let message = route("fefefe0fffefe0", &mut state, 0).unwrap();
        match message {
            Message::ChargeTest(result) => {
                assert_eq!(result.status, 0xfe);
                assert_close(result.idle_volt, 40.64);
                assert_close(result.high_volt, 40.95);
            }
            other => panic!("expected charge test, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_charge_test_offsets() {
        let result = parse_charge_test("fe0a64c8c8").unwrap();
        assert_eq!(result.status, 10);
        assert_close(result.idle_volt, 16.12);
        assert_close(result.high_volt, 22.48);
    }

    #[test]
    fn test_parse_charge_test_truncated_high_volt() {
        let result = parse_charge_test("fe0a64c8").unwrap();
        assert_eq!(result.status, 10);
        assert_close(result.idle_volt, 16.12);
        assert_close(result.high_volt, 0.08);
    }

    #[test]
    fn test_parse_charge_test_too_short() {
        assert!(matches!(
            parse_charge_test("fe0a64c"),
            Err(Bm2Error::ParseError(_))
        ));
        assert!(parse_charge_test("fe").is_err());
    }

    #[test]
    fn test_parse_voltage_status_updates_state() {
        let mut state = SessionState::default();
        let status = parse_voltage_status("004d81640032001e", &mut state).unwrap();

        assert_close(status.voltage, 12.40);
        assert_eq!(status.status, 1);
        assert_eq!(status.battery_power, 100);
        assert_eq!(status.time_b, 50);
        assert_eq!(status.time_c, 30);
        assert_eq!(state.last_time_b, 50);
        assert_eq!(state.last_time_c, 30);
    }

    #[test]
    fn test_parse_voltage_status_failure_keeps_state() {
        let mut state = SessionState {
            last_time_b: 7,
            last_time_c: 9,
        };
        assert!(parse_voltage_status("004d8164", &mut state).is_err());
        assert!(parse_voltage_status("004d8164zz32001e", &mut state).is_err());
        assert_eq!(state.last_time_b, 7);
        assert_eq!(state.last_time_c, 9);
    }

    #[test]
    fn test_parse_crank_test_fields_and_samples() {
        let state = SessionState::default();
        let result =
            parse_crank_test("000000024d814b04b00fffefe00000000", &state, 1_000_000).unwrap();

        assert_eq!(result.base_value, 2);
        assert_close(result.voltage, 12.40);
        assert_eq!(result.status, 1);
        // tail "4b04b00" leaves a one character group, dropped
        assert_eq!(result.voltages.len(), 2);
        assert_close(result.voltages[0], 12.00);
        assert_close(result.voltages[1], 12.00);
        assert_eq!(result.test_time_ms, 1_000_000 - 240_000);
    }

    #[test]
    fn test_parse_crank_test_without_marker_reads_to_end() {
        let state = SessionState::default();
        let result = parse_crank_test("000000014d804b04b0", &state, 500_000).unwrap();
        assert_eq!(result.voltages.len(), 2);
        assert_eq!(result.test_time_ms, 500_000 - 120_000);
    }

    #[test]
    fn test_parse_crank_test_early_marker_gives_empty_tail() {
        let state = SessionState::default();
        let result = parse_crank_test("fffefe0000014d80", &state, 0).unwrap();
        assert!(result.voltages.is_empty());
    }

    #[test]
    fn test_crank_timing_uses_voltage_timers() {
        let state = SessionState {
            last_time_b: 50,
            last_time_c: 30,
        };
        assert_eq!(crank_elapsed_seconds(2, &state), 260);

        let now = 10_000_000;
        let result = parse_crank_test("000000024d81fffefe", &state, now).unwrap();
        assert_eq!(result.test_time_ms, now - 260_000);
    }

    #[test]
    fn test_crank_timing_ignores_large_timers() {
        for time_c in [0, 30, 500] {
            let state = SessionState {
                last_time_b: 150,
                last_time_c: time_c,
            };
            assert_eq!(crank_elapsed_seconds(1, &state), 120);
        }
    }

    #[test]
    fn test_crank_timing_never_in_the_future() {
        let state = SessionState {
            last_time_b: 0,
            last_time_c: 100,
        };
        assert_eq!(crank_elapsed_seconds(0, &state), -100);
        let result = parse_crank_test("000000004d81fffefe", &state, 42).unwrap();
        assert_eq!(result.test_time_ms, 42);
    }

    #[test]
    fn test_parse_history_order_and_timestamps() {
        let t = 1_700_000_000_000;
        let records = parse_history("4d8000014b0000024e200003", t).unwrap();

        assert_eq!(records.len(), 3);
        assert_close(records[0].voltage, 12.50);
        assert_eq!(records[0].record_type, 3);
        assert_eq!(records[0].time_ms, t - 240_000);
        assert_close(records[1].voltage, 12.00);
        assert_eq!(records[1].record_type, 2);
        assert_eq!(records[1].time_ms, t - 120_000);
        assert_close(records[2].voltage, 12.40);
        assert_eq!(records[2].record_type, 1);
        assert_eq!(records[2].time_ms, t);
    }

    #[test]
    fn test_parse_history_ignores_partial_record() {
        let records = parse_history("4d800001abc", 0).unwrap();
        assert_eq!(records.len(), 1);
        assert!(parse_history("", 0).unwrap().is_empty());
    }

    #[test]
    fn test_decode_history_wraps_records() {
        match decode_history("4d8000014b000002", 240_000).unwrap() {
            Message::History(records) => {
                assert_eq!(records.len(), 2);
                assert_eq!(records[0].time_ms, 120_000);
                assert_eq!(records[1].record_type, 1);
            }
            other => panic!("expected history, got {other:?}"),
        }
        assert!(decode_history("4d8000zz", 0).is_err());
    }

    #[test]
    fn test_short_payload_is_unrecognized() {
        let mut state = SessionState::default();
        assert_eq!(route("0102", &mut state, 0).unwrap(), Message::Unrecognized);
    }

    #[test]
    fn test_decode_frame_decrypts_and_routes() {
        let cipher = FrameCipher::default();
        let mut state = SessionState::default();
        let frame = encrypt(&hex::decode("004d80640032001e").unwrap());

        let message = decode_frame(&cipher, &frame, &mut state, 0).unwrap();
        match message {
            Message::VoltageStatus(status) => {
                assert_close(status.voltage, 12.40);
                assert_eq!(status.battery_power, 100);
            }
            other => panic!("expected voltage status, got {other:?}"),
        }
        assert_eq!(state.last_time_b, 50);
        assert_eq!(state.last_time_c, 30);
    }
}
