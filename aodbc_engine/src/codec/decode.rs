//! Column decoding: driver-native cell reads into host values.
//!
//! Fixed-width types come back in one typed read. Variable-length text is
//! pulled through a growing buffer, retrying the read with a larger
//! allocation whenever the driver reports truncation.

use crate::codec::{Date, Time, Timestamp, Value};
use crate::driver::{
    driver_error, CDataType, CellRead, ColAttr, ColumnDescription, Driver, NativeHandle,
    NumericValue, SqlDataType, SqlReturn, StmtHandle, TextEncoding,
};
use crate::error::Result;

/// Initial text buffer: this many data bytes plus one terminator unit.
const INITIAL_TEXT_BYTES: usize = 4096;

/// Indicator value meaning the driver cannot report the remaining length.
const NO_TOTAL: i64 = -4;

/// Decode the current row's cell in `column_number`, dispatching on the
/// described SQL type. Unrecognized types fall back to a wide text read,
/// which every driver can serve.
pub fn decode_column(
    driver: &dyn Driver,
    stmt: StmtHandle,
    column_number: u16,
    description: &ColumnDescription,
) -> Result<Value> {
    match description.sql_type {
        SqlDataType::INTEGER | SqlDataType::SMALLINT | SqlDataType::TINYINT => {
            decode_integer(driver, stmt, column_number, description.sql_type, false)
        }
        SqlDataType::BIGINT => {
            decode_integer(driver, stmt, column_number, description.sql_type, true)
        }
        SqlDataType::FLOAT | SqlDataType::REAL | SqlDataType::DOUBLE => {
            let read = driver.get_f64(stmt, column_number, CDataType::Double);
            Ok(match fixed_value(driver, stmt, read)? {
                Some(v) => Value::Double(v),
                None => Value::Null,
            })
        }
        SqlDataType::BIT => {
            let read = driver.get_bit(stmt, column_number);
            Ok(match fixed_value(driver, stmt, read)? {
                Some(v) => Value::Bool(v != 0),
                None => Value::Null,
            })
        }
        SqlDataType::TYPE_TIMESTAMP => {
            let read = driver.get_timestamp(stmt, column_number);
            Ok(match fixed_value(driver, stmt, read)? {
                Some(ts) => Value::Timestamp(Timestamp {
                    year: ts.year,
                    month: ts.month as u8,
                    day: ts.day as u8,
                    hour: ts.hour as u8,
                    minute: ts.minute as u8,
                    second: ts.second as u8,
                    // Wire fraction is billionths of a second.
                    microsecond: ts.fraction / 1000,
                }),
                None => Value::Null,
            })
        }
        SqlDataType::TYPE_DATE => {
            let read = driver.get_date(stmt, column_number);
            Ok(match fixed_value(driver, stmt, read)? {
                Some(d) => Value::Date(Date {
                    year: d.year,
                    month: d.month as u8,
                    day: d.day as u8,
                }),
                None => Value::Null,
            })
        }
        // SS_TIME2 is SQL Server's time type; the sub-second part is
        // dropped, matching the plain TIME read.
        SqlDataType::TYPE_TIME | SqlDataType::SS_TIME2 => {
            let read = driver.get_time(stmt, column_number);
            Ok(match fixed_value(driver, stmt, read)? {
                Some(t) => Value::Time(Time {
                    hour: t.hour as u8,
                    minute: t.minute as u8,
                    second: t.second as u8,
                }),
                None => Value::Null,
            })
        }
        SqlDataType::NUMERIC | SqlDataType::DECIMAL => {
            decode_packed_decimal(driver, stmt, column_number)
        }
        // datetimeoffset is served in character form only; it is the one
        // type read as narrow text.
        SqlDataType::SS_TIMESTAMP_OFFSET => {
            decode_text(driver, stmt, column_number, TextEncoding::Narrow)
        }
        // Both char families and anything the dispatch does not know
        // travel as wide text.
        _ => decode_text(driver, stmt, column_number, TextEncoding::Wide),
    }
}

fn decode_integer(
    driver: &dyn Driver,
    stmt: StmtHandle,
    column_number: u16,
    sql_type: SqlDataType,
    big: bool,
) -> Result<Value> {
    let unsigned = {
        let read = driver.col_attribute(stmt, column_number, ColAttr::Unsigned);
        if !read.rc.succeeded() {
            return Err(driver_error(
                driver,
                NativeHandle::Stmt(stmt),
                "decode_column::SQLColAttribute",
            ));
        }
        read.value != 0
    };
    let target = match (sql_type, unsigned) {
        (SqlDataType::TINYINT, false) => CDataType::STinyInt,
        (SqlDataType::TINYINT, true) => CDataType::UTinyInt,
        (_, true) if big => CDataType::UBigInt,
        (_, false) if big => CDataType::SBigInt,
        (_, true) => CDataType::ULong,
        (_, false) => CDataType::Long,
    };
    let read = driver.get_int(stmt, column_number, target);
    Ok(match fixed_value(driver, stmt, read)? {
        Some(v) if target.is_unsigned() => Value::UInt(v as u64),
        Some(v) => Value::Int(v),
        None => Value::Null,
    })
}

fn decode_packed_decimal(
    driver: &dyn Driver,
    stmt: StmtHandle,
    column_number: u16,
) -> Result<Value> {
    let precision = attribute(driver, stmt, column_number, ColAttr::Precision)?;
    let scale = attribute(driver, stmt, column_number, ColAttr::Scale)?;
    let rc = driver.set_numeric_descriptor(stmt, column_number, precision, scale);
    if !rc.succeeded() {
        return Err(driver_error(
            driver,
            NativeHandle::Stmt(stmt),
            "decode_column::SQLSetDescField",
        ));
    }
    let read = driver.get_numeric(stmt, column_number);
    Ok(match fixed_value(driver, stmt, read)? {
        Some(numeric) => Value::Double(numeric_to_f64(&numeric)),
        None => Value::Null,
    })
}

/// Unpack the packed-decimal magnitude and apply scale and sign.
///
/// The magnitude is a little-endian sequence of base-16 digit pairs; digit
/// `2 * i` is the low nibble of byte `i` and digit `2 * i + 1` the high
/// nibble. The largest shift is 124 bits, which a u128 accumulator holds
/// without overflow.
pub fn numeric_to_f64(numeric: &NumericValue) -> f64 {
    let mut magnitude: u128 = 0;
    for (i, byte) in numeric.val.iter().enumerate() {
        let position = 2 * i as u32;
        magnitude += u128::from(byte & 0x0f) << (4 * position);
        magnitude += u128::from(byte >> 4) << (4 * (position + 1));
    }
    let mut value = magnitude as f64 / 10f64.powi(i32::from(numeric.scale));
    // Sign byte 0 marks a negative magnitude.
    if numeric.sign == 0 {
        value = -value;
    }
    value
}

fn attribute(
    driver: &dyn Driver,
    stmt: StmtHandle,
    column_number: u16,
    attr: ColAttr,
) -> Result<i64> {
    let read = driver.col_attribute(stmt, column_number, attr);
    if !read.rc.succeeded() {
        return Err(driver_error(
            driver,
            NativeHandle::Stmt(stmt),
            "decode_column::SQLColAttribute",
        ));
    }
    Ok(read.value)
}

fn fixed_value<T>(driver: &dyn Driver, stmt: StmtHandle, read: CellRead<T>) -> Result<Option<T>> {
    if !read.rc.succeeded() {
        return Err(driver_error(
            driver,
            NativeHandle::Stmt(stmt),
            "decode_column::SQLGetData",
        ));
    }
    if read.indicator.is_null() {
        return Ok(None);
    }
    Ok(Some(read.value))
}

fn decode_text(
    driver: &dyn Driver,
    stmt: StmtHandle,
    column_number: u16,
    encoding: TextEncoding,
) -> Result<Value> {
    match read_text(driver, stmt, column_number, encoding)? {
        Some(bytes) => Ok(Value::Text(decode_bytes(&bytes, encoding))),
        None => Ok(Value::Null),
    }
}

/// Pull one variable-length cell through repeated partial reads.
///
/// Each call hands the driver the unused tail of the buffer; a truncated
/// read reports the bytes that remained available beforehand, so the buffer
/// grows to exactly the final size and the next write position backs up one
/// unit to overwrite the stale terminator.
fn read_text(
    driver: &dyn Driver,
    stmt: StmtHandle,
    column_number: u16,
    encoding: TextEncoding,
) -> Result<Option<Vec<u8>>> {
    let unit = encoding.unit();
    let mut buf = vec![0u8; INITIAL_TEXT_BYTES + unit];
    let mut write_unit = 0usize;
    let mut consumed = 0usize;
    loop {
        let can_read = buf.len() - write_unit * unit;
        let (rc, indicator) = driver.get_text(stmt, column_number, encoding, {
            let start = write_unit * unit;
            &mut buf[start..]
        });
        match rc {
            SqlReturn::Success => {
                if indicator.is_null() {
                    return Ok(None);
                }
                consumed += indicator.0 as usize;
                buf.truncate(consumed);
                return Ok(Some(buf));
            }
            SqlReturn::SuccessWithInfo => {
                if indicator.is_null() {
                    return Ok(None);
                }
                let written = can_read - unit;
                consumed += written;
                let target = if indicator.0 == NO_TOTAL {
                    // No length hint; double the allocation.
                    buf.len() * 2
                } else {
                    // `indicator` counted from before this call, so this is
                    // the exact final size plus the terminator.
                    consumed + (indicator.0 as usize - written) + unit
                };
                buf.resize(target, 0);
                write_unit += can_read / unit - 1;
            }
            SqlReturn::StillExecuting => continue,
            SqlReturn::NoData => {
                buf.truncate(consumed);
                return Ok(Some(buf));
            }
            SqlReturn::Error | SqlReturn::InvalidHandle => {
                return Err(driver_error(
                    driver,
                    NativeHandle::Stmt(stmt),
                    "decode_column::SQLGetData",
                ));
            }
        }
    }
}

fn decode_bytes(bytes: &[u8], encoding: TextEncoding) -> String {
    match encoding {
        TextEncoding::Narrow => String::from_utf8_lossy(bytes).into_owned(),
        TextEncoding::Wide => {
            let units: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
    }
}
