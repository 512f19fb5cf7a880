//! Parameter binding: host values into driver-native parameter buffers.

use crate::codec::Value;
use crate::driver::{
    driver_error, CDataType, DateValue, Driver, Indicator, NativeHandle, SqlDataType, StmtHandle,
    TimeValue, TimestampValue,
};
use crate::error::{AodbcError, Result};

/// Character count beyond which text binds as long variable text.
const LONG_TEXT_THRESHOLD: usize = 2000;

/// Integer values outside this range bind as 64-bit.
const INT32_MIN: i64 = -2_147_483_647;
const INT32_MAX: i64 = 2_147_483_647;

/// The payload a bound parameter owns. Exactly one variant per parameter;
/// heap-owning variants release their allocation when the parameter set is
/// dropped, so no separate ownership flag exists.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterPayload {
    Null,
    Int32(i32),
    Int64(i64),
    Bit(u8),
    Double(f64),
    WideText(Vec<u16>),
    Timestamp(TimestampValue),
    Date(DateValue),
    Time(TimeValue),
}

/// One bound parameter: the wire tags handed to the driver plus the owned
/// storage the driver reads from.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub c_type: CDataType,
    pub sql_type: SqlDataType,
    pub column_size: u64,
    pub decimal_digits: i16,
    pub indicator: Indicator,
    pub payload: ParameterPayload,
}

/// Count `?` placeholder tokens in the query text.
pub fn count_placeholders(query: &str) -> usize {
    query.chars().filter(|c| *c == '?').count()
}

/// Validate parameter count against the query's placeholders before any
/// binding is attempted.
pub fn check_parameter_count(query: &str, given: usize) -> Result<()> {
    let expected = count_placeholders(query);
    if expected != given {
        return Err(AodbcError::ParameterCountMismatch { expected, given });
    }
    Ok(())
}

fn build_parameter(value: &Value, position: usize) -> Result<Parameter> {
    let parameter = match value {
        // Checked ahead of the integer arm: a boolean is representable as
        // an integer but must travel with the bit wire tag.
        Value::Bool(v) => Parameter {
            c_type: CDataType::Bit,
            sql_type: SqlDataType::BIT,
            column_size: 0,
            decimal_digits: 0,
            indicator: Indicator::NTS,
            payload: ParameterPayload::Bit(u8::from(*v)),
        },
        Value::Int(v) => integer_parameter(*v),
        Value::UInt(v) => {
            let signed = i64::try_from(*v)
                .map_err(|_| AodbcError::UnsupportedParameterType { position })?;
            integer_parameter(signed)
        }
        Value::Double(v) => Parameter {
            c_type: CDataType::Double,
            sql_type: SqlDataType::DOUBLE,
            column_size: 0,
            decimal_digits: 0,
            indicator: Indicator::NTS,
            payload: ParameterPayload::Double(*v),
        },
        Value::Text(text) => {
            let sql_type = if text.chars().count() > LONG_TEXT_THRESHOLD {
                SqlDataType::WLONGVARCHAR
            } else {
                SqlDataType::WVARCHAR
            };
            let wide: Vec<u16> = text.encode_utf16().collect();
            let byte_length = (wide.len() * 2) as i64;
            Parameter {
                c_type: CDataType::WChar,
                sql_type,
                column_size: byte_length as u64,
                decimal_digits: 0,
                indicator: Indicator(byte_length),
                payload: ParameterPayload::WideText(wide),
            }
        }
        Value::Timestamp(ts) => {
            let fraction_ns = ts.microsecond.saturating_mul(1000);
            Parameter {
                c_type: CDataType::TypeTimestamp,
                sql_type: SqlDataType::TYPE_TIMESTAMP,
                column_size: std::mem::size_of::<TimestampValue>() as u64,
                decimal_digits: if fraction_ns != 0 { 6 } else { 0 },
                indicator: Indicator::NTS,
                payload: ParameterPayload::Timestamp(TimestampValue {
                    year: ts.year,
                    month: u16::from(ts.month),
                    day: u16::from(ts.day),
                    hour: u16::from(ts.hour),
                    minute: u16::from(ts.minute),
                    second: u16::from(ts.second),
                    fraction: fraction_ns,
                }),
            }
        }
        Value::Date(date) => Parameter {
            c_type: CDataType::TypeDate,
            sql_type: SqlDataType::TYPE_DATE,
            column_size: std::mem::size_of::<DateValue>() as u64,
            decimal_digits: 0,
            indicator: Indicator::NTS,
            payload: ParameterPayload::Date(DateValue {
                year: date.year,
                month: u16::from(date.month),
                day: u16::from(date.day),
            }),
        },
        Value::Time(time) => Parameter {
            c_type: CDataType::TypeTime,
            sql_type: SqlDataType::TYPE_TIME,
            column_size: std::mem::size_of::<TimeValue>() as u64,
            decimal_digits: 0,
            indicator: Indicator::NTS,
            payload: ParameterPayload::Time(TimeValue {
                hour: u16::from(time.hour),
                minute: u16::from(time.minute),
                second: u16::from(time.second),
            }),
        },
        Value::Null => Parameter {
            c_type: CDataType::Char,
            sql_type: SqlDataType::VARCHAR,
            column_size: 1,
            decimal_digits: 0,
            indicator: Indicator::NULL_DATA,
            payload: ParameterPayload::Null,
        },
    };
    Ok(parameter)
}

fn integer_parameter(value: i64) -> Parameter {
    // Both the wire tag and the storage width change together.
    if !(INT32_MIN..=INT32_MAX).contains(&value) {
        Parameter {
            c_type: CDataType::SBigInt,
            sql_type: SqlDataType::BIGINT,
            column_size: 0,
            decimal_digits: 0,
            indicator: Indicator::NTS,
            payload: ParameterPayload::Int64(value),
        }
    } else {
        Parameter {
            c_type: CDataType::Long,
            sql_type: SqlDataType::INTEGER,
            column_size: 0,
            decimal_digits: 0,
            indicator: Indicator::NTS,
            payload: ParameterPayload::Int32(value as i32),
        }
    }
}

/// Bind every value to the statement, in order. On failure the parameters
/// built so far are released (their owned buffers drop here) and the error
/// names the 1-based position where binding stopped; no native execute has
/// happened yet.
pub fn bind_parameters(
    driver: &dyn Driver,
    stmt: StmtHandle,
    values: &[Value],
) -> Result<Vec<Parameter>> {
    let mut bound = Vec::with_capacity(values.len());
    for (index, value) in values.iter().enumerate() {
        let position = index + 1;
        let parameter = build_parameter(value, position)?;
        let rc = driver.bind_parameter(stmt, position as u16, &parameter);
        if !rc.succeeded() {
            return Err(driver_error(
                driver,
                NativeHandle::Stmt(stmt),
                "bind_parameter::SQLBindParameter",
            ));
        }
        bound.push(parameter);
    }
    Ok(bound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Date, Time, Timestamp};
    use crate::driver::testing::ScriptedDriver;
    use crate::driver::Driver;

    fn bind_one(value: Value) -> (ScriptedDriver, Vec<Parameter>) {
        let driver = ScriptedDriver::new();
        let stmt = driver.open_stmt();
        let bound = bind_parameters(&driver, stmt, &[value]).expect("bind failed");
        (driver, bound)
    }

    #[test]
    fn test_count_placeholders() {
        assert_eq!(count_placeholders("SELECT 1"), 0);
        assert_eq!(count_placeholders("SELECT ? AS a"), 1);
        assert_eq!(count_placeholders("INSERT INTO t VALUES (?, ?, ?)"), 3);
    }

    #[test]
    fn test_check_parameter_count_mismatch() {
        let err = check_parameter_count("SELECT ?, ?", 1).unwrap_err();
        match err {
            AodbcError::ParameterCountMismatch { expected, given } => {
                assert_eq!(expected, 2);
                assert_eq!(given, 1);
            }
            other => panic!("expected ParameterCountMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_bool_binds_as_bit_never_integer() {
        for flag in [false, true] {
            let (driver, bound) = bind_one(Value::Bool(flag));
            assert_eq!(bound[0].c_type, CDataType::Bit);
            assert_eq!(bound[0].sql_type, SqlDataType::BIT);
            // Inspect the wire tag the driver actually observed.
            let recorded = driver.recorded_binds();
            assert_eq!(recorded.len(), 1);
            assert_eq!(recorded[0].c_type, CDataType::Bit);
            assert_ne!(recorded[0].c_type, CDataType::Long);
        }
    }

    #[test]
    fn test_small_integer_binds_32_bit() {
        let (_, bound) = bind_one(Value::Int(42));
        assert_eq!(bound[0].c_type, CDataType::Long);
        assert_eq!(bound[0].sql_type, SqlDataType::INTEGER);
        assert_eq!(bound[0].payload, ParameterPayload::Int32(42));
    }

    #[test]
    fn test_wide_integer_binds_64_bit() {
        let (_, bound) = bind_one(Value::Int(3_000_000_000));
        assert_eq!(bound[0].c_type, CDataType::SBigInt);
        assert_eq!(bound[0].sql_type, SqlDataType::BIGINT);
        assert_eq!(bound[0].payload, ParameterPayload::Int64(3_000_000_000));
    }

    #[test]
    fn test_integer_boundary_values() {
        let (_, bound) = bind_one(Value::Int(INT32_MAX));
        assert_eq!(bound[0].c_type, CDataType::Long);
        let (_, bound) = bind_one(Value::Int(INT32_MAX + 1));
        assert_eq!(bound[0].c_type, CDataType::SBigInt);
        let (_, bound) = bind_one(Value::Int(INT32_MIN));
        assert_eq!(bound[0].c_type, CDataType::Long);
        let (_, bound) = bind_one(Value::Int(INT32_MIN - 1));
        assert_eq!(bound[0].c_type, CDataType::SBigInt);
    }

    #[test]
    fn test_short_text_binds_wvarchar() {
        let (_, bound) = bind_one(Value::from("héllo"));
        assert_eq!(bound[0].c_type, CDataType::WChar);
        assert_eq!(bound[0].sql_type, SqlDataType::WVARCHAR);
        // Indicator counts UTF-16 code units in bytes.
        assert_eq!(bound[0].indicator, Indicator(10));
    }

    #[test]
    fn test_long_text_binds_wlongvarchar() {
        let text = "x".repeat(2001);
        let (_, bound) = bind_one(Value::from(text));
        assert_eq!(bound[0].sql_type, SqlDataType::WLONGVARCHAR);
    }

    #[test]
    fn test_threshold_text_stays_wvarchar() {
        let text = "x".repeat(2000);
        let (_, bound) = bind_one(Value::from(text));
        assert_eq!(bound[0].sql_type, SqlDataType::WVARCHAR);
    }

    #[test]
    fn test_null_binds_placeholder_with_null_indicator() {
        let (_, bound) = bind_one(Value::Null);
        assert_eq!(bound[0].sql_type, SqlDataType::VARCHAR);
        assert_eq!(bound[0].column_size, 1);
        assert!(bound[0].indicator.is_null());
        assert_eq!(bound[0].payload, ParameterPayload::Null);
    }

    #[test]
    fn test_timestamp_fraction_converts_to_nanoseconds() {
        let ts = Timestamp {
            year: 2024,
            month: 3,
            day: 9,
            hour: 12,
            minute: 30,
            second: 15,
            microsecond: 250,
        };
        let (_, bound) = bind_one(Value::Timestamp(ts));
        assert_eq!(bound[0].decimal_digits, 6);
        match &bound[0].payload {
            ParameterPayload::Timestamp(wire) => assert_eq!(wire.fraction, 250_000),
            other => panic!("expected timestamp payload, got {other:?}"),
        }
    }

    #[test]
    fn test_whole_second_timestamp_has_no_decimal_digits() {
        let ts = Timestamp {
            year: 2024,
            month: 1,
            day: 1,
            hour: 0,
            minute: 0,
            second: 0,
            microsecond: 0,
        };
        let (_, bound) = bind_one(Value::Timestamp(ts));
        assert_eq!(bound[0].decimal_digits, 0);
    }

    #[test]
    fn test_date_and_time_payloads() {
        let (_, bound) = bind_one(Value::Date(Date {
            year: 1999,
            month: 12,
            day: 31,
        }));
        assert_eq!(bound[0].sql_type, SqlDataType::TYPE_DATE);

        let (_, bound) = bind_one(Value::Time(Time {
            hour: 23,
            minute: 59,
            second: 58,
        }));
        assert_eq!(bound[0].sql_type, SqlDataType::TYPE_TIME);
    }

    #[test]
    fn test_unsupported_uint_names_position() {
        let driver = ScriptedDriver::new();
        let stmt = driver.open_stmt();
        let err =
            bind_parameters(&driver, stmt, &[Value::Int(1), Value::UInt(u64::MAX)]).unwrap_err();
        match err {
            AodbcError::UnsupportedParameterType { position } => assert_eq!(position, 2),
            other => panic!("expected UnsupportedParameterType, got {other:?}"),
        }
    }

    #[test]
    fn test_failed_bind_stops_and_reports_driver_error() {
        let driver = ScriptedDriver::new();
        let stmt = driver.open_stmt();
        driver.fail_bind_at(2);
        let err = bind_parameters(&driver, stmt, &[Value::Int(1), Value::Int(2), Value::Int(3)])
            .unwrap_err();
        assert!(matches!(err, AodbcError::Driver { .. }));
        // Binding aborted at the failing slot; nothing after it reached the
        // driver.
        assert_eq!(driver.recorded_binds().len(), 1);
    }
}
