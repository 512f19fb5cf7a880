//! The call-level interface seam.
//!
//! Everything the core needs from the native database interface is expressed
//! through the [`Driver`] trait; the engine never calls the platform API
//! directly. The `odbc` feature provides the real backend over `odbc-sys`;
//! the `test-helpers` feature provides a scripted in-memory backend.

use crate::codec::bind::Parameter;
use crate::error::Result;
use crate::signal::WaitEvent;
use std::sync::Arc;

#[cfg(feature = "odbc")]
pub mod odbc;
#[cfg(any(test, feature = "test-helpers"))]
pub mod testing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnvHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StmtHandle(pub u32);

/// Handle an asynchronous operation completes or reports diagnostics on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeHandle {
    Conn(ConnHandle),
    Stmt(StmtHandle),
}

/// Return code of a native call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlReturn {
    Success,
    SuccessWithInfo,
    StillExecuting,
    NoData,
    Error,
    InvalidHandle,
}

impl SqlReturn {
    pub fn succeeded(self) -> bool {
        matches!(self, SqlReturn::Success | SqlReturn::SuccessWithInfo)
    }

    /// Accepted as the immediate outcome of launching an asynchronous call.
    pub fn accepted(self) -> bool {
        self.succeeded() || self == SqlReturn::StillExecuting
    }
}

/// Length-or-indicator value reported alongside each read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Indicator(pub i64);

impl Indicator {
    pub const NULL_DATA: Indicator = Indicator(-1);
    /// Null-terminated string marker used when binding.
    pub const NTS: Indicator = Indicator(-3);

    pub fn is_null(self) -> bool {
        self == Self::NULL_DATA
    }
}

/// SQL type tag reported for a result column at describe time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqlDataType(pub i16);

impl SqlDataType {
    pub const CHAR: SqlDataType = SqlDataType(1);
    pub const NUMERIC: SqlDataType = SqlDataType(2);
    pub const DECIMAL: SqlDataType = SqlDataType(3);
    pub const INTEGER: SqlDataType = SqlDataType(4);
    pub const SMALLINT: SqlDataType = SqlDataType(5);
    pub const FLOAT: SqlDataType = SqlDataType(6);
    pub const REAL: SqlDataType = SqlDataType(7);
    pub const DOUBLE: SqlDataType = SqlDataType(8);
    pub const VARCHAR: SqlDataType = SqlDataType(12);
    pub const TYPE_DATE: SqlDataType = SqlDataType(91);
    pub const TYPE_TIME: SqlDataType = SqlDataType(92);
    pub const TYPE_TIMESTAMP: SqlDataType = SqlDataType(93);
    pub const LONGVARCHAR: SqlDataType = SqlDataType(-1);
    pub const BIGINT: SqlDataType = SqlDataType(-5);
    pub const TINYINT: SqlDataType = SqlDataType(-6);
    pub const BIT: SqlDataType = SqlDataType(-7);
    pub const WCHAR: SqlDataType = SqlDataType(-8);
    pub const WVARCHAR: SqlDataType = SqlDataType(-9);
    pub const WLONGVARCHAR: SqlDataType = SqlDataType(-10);
    /// SQL Server 2008+ `time`.
    pub const SS_TIME2: SqlDataType = SqlDataType(-154);
    /// SQL Server `datetimeoffset`.
    pub const SS_TIMESTAMP_OFFSET: SqlDataType = SqlDataType(-155);
}

/// C target type tag used when binding a parameter or reading a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CDataType {
    Char,
    WChar,
    Long,
    ULong,
    SBigInt,
    UBigInt,
    STinyInt,
    UTinyInt,
    Bit,
    Float,
    Double,
    TypeDate,
    TypeTime,
    TypeTimestamp,
    Numeric,
}

impl CDataType {
    /// Raw ODBC `SQL_C_*` tag.
    pub fn raw(self) -> i16 {
        match self {
            CDataType::Char => 1,
            CDataType::WChar => -8,
            CDataType::Long => 4,
            CDataType::ULong => -18,
            CDataType::SBigInt => -25,
            CDataType::UBigInt => -27,
            CDataType::STinyInt => -26,
            CDataType::UTinyInt => -28,
            CDataType::Bit => -7,
            CDataType::Float => 7,
            CDataType::Double => 8,
            CDataType::TypeDate => 91,
            CDataType::TypeTime => 92,
            CDataType::TypeTimestamp => 93,
            CDataType::Numeric => 2,
        }
    }

    pub fn is_unsigned(self) -> bool {
        matches!(
            self,
            CDataType::ULong | CDataType::UBigInt | CDataType::UTinyInt
        )
    }
}

/// Character width of a variable-length read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Narrow,
    Wide,
}

impl TextEncoding {
    /// Size of one data unit in bytes (the terminator occupies one unit).
    pub fn unit(self) -> usize {
        match self {
            TextEncoding::Narrow => 1,
            TextEncoding::Wide => 2,
        }
    }
}

/// Column metadata attributes queried during decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColAttr {
    Unsigned,
    Precision,
    Scale,
}

pub const MAX_NUMERIC_LEN: usize = 16;

/// Wire form of a timestamp; `fraction` is in nanosecond-like units
/// (billionths of a second).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimestampValue {
    pub year: i16,
    pub month: u16,
    pub day: u16,
    pub hour: u16,
    pub minute: u16,
    pub second: u16,
    pub fraction: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DateValue {
    pub year: i16,
    pub month: u16,
    pub day: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeValue {
    pub hour: u16,
    pub minute: u16,
    pub second: u16,
}

/// Packed-decimal wire form: `val` holds the magnitude as a little-endian
/// sequence of base-16 digit pairs; `sign` 0 means negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumericValue {
    pub precision: u8,
    pub scale: i8,
    pub sign: u8,
    pub val: [u8; MAX_NUMERIC_LEN],
}

impl Default for NumericValue {
    fn default() -> Self {
        Self {
            precision: 0,
            scale: 0,
            sign: 1,
            val: [0; MAX_NUMERIC_LEN],
        }
    }
}

/// Result-column description, queried once per column before fetching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescription {
    pub name: String,
    pub sql_type: SqlDataType,
    pub size: u64,
    pub decimal_digits: i16,
    pub nullable: bool,
}

/// First diagnostic record of a handle, as SQLGetDiagRecW reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub sqlstate: [u8; 5],
    pub native_code: i32,
    pub message: String,
}

/// Outcome of one typed fixed-width read. `value` is meaningful only when
/// the return code succeeded and the indicator is not null.
#[derive(Debug, Clone, Copy)]
pub struct CellRead<T> {
    pub rc: SqlReturn,
    pub indicator: Indicator,
    pub value: T,
}

impl<T> CellRead<T> {
    pub fn new(rc: SqlReturn, indicator: Indicator, value: T) -> Self {
        Self {
            rc,
            indicator,
            value,
        }
    }
}

/// The native call-level interface. Function contracts follow the ODBC CLI;
/// implementations are external collaborators of the core.
///
/// The blocking verbs (`connect`, `disconnect`, `execute`) may be invoked
/// from a completion signal's worker thread while other methods run on the
/// caller thread, so implementations must be internally synchronized.
/// Column numbers and parameter numbers are 1-based throughout.
pub trait Driver: Send + Sync + 'static {
    // Handle lifecycle.
    fn alloc_env(&self) -> Result<EnvHandle>;
    fn set_odbc_version(&self, env: EnvHandle) -> SqlReturn;
    fn alloc_conn(&self, env: EnvHandle) -> Result<ConnHandle>;
    fn free_conn(&self, conn: ConnHandle) -> SqlReturn;
    fn free_env(&self, env: EnvHandle) -> SqlReturn;
    fn alloc_stmt(&self, conn: ConnHandle) -> Result<StmtHandle>;
    fn free_stmt(&self, stmt: StmtHandle) -> SqlReturn;

    // Attributes and capabilities.
    fn set_login_timeout(&self, conn: ConnHandle, secs: i64) -> SqlReturn;
    fn set_query_timeout(&self, stmt: StmtHandle, secs: i64) -> SqlReturn;
    /// None when the driver cannot report the limit; the session then
    /// assumes 1.
    fn max_concurrent_activities(&self, conn: ConnHandle) -> Option<u16>;

    // Asynchronous completion. `Some` switches the operation to native
    // async mode (async attributes configured, OS wait object returned);
    // `None` selects worker-thread emulation.
    fn connection_event(&self, conn: ConnHandle) -> Result<Option<Box<dyn WaitEvent>>>;
    fn statement_event(&self, stmt: StmtHandle) -> Result<Option<Box<dyn WaitEvent>>>;
    /// Finalize an asynchronous call and retrieve its return code.
    fn complete_async(&self, handle: NativeHandle) -> SqlReturn;

    // Blocking verbs. Query and DSN text travels as UTF-16, matching the
    // wide entry points of the CLI.
    fn connect(&self, conn: ConnHandle, dsn: &[u16]) -> SqlReturn;
    fn disconnect(&self, conn: ConnHandle) -> SqlReturn;
    fn execute(&self, stmt: StmtHandle, query: &[u16]) -> SqlReturn;

    // Parameter binding. The implementation must keep whatever it needs
    // from `parameter` valid until the statement's buffers are reset or
    // the handle is freed.
    fn bind_parameter(&self, stmt: StmtHandle, number: u16, parameter: &Parameter) -> SqlReturn;
    fn reset_parameters(&self, stmt: StmtHandle) -> SqlReturn;

    // Result-set verbs.
    fn num_result_cols(&self, stmt: StmtHandle) -> CellRead<i16>;
    fn fetch(&self, stmt: StmtHandle) -> SqlReturn;
    fn describe_col(&self, stmt: StmtHandle, column_number: u16) -> Result<ColumnDescription>;
    fn col_attribute(&self, stmt: StmtHandle, column_number: u16, attr: ColAttr) -> CellRead<i64>;
    /// Tell the row descriptor the precision and scale to use for a
    /// packed-decimal read of this column.
    fn set_numeric_descriptor(
        &self,
        stmt: StmtHandle,
        column_number: u16,
        precision: i64,
        scale: i64,
    ) -> SqlReturn;

    // Fixed-width reads. `target` selects signedness where applicable.
    fn get_int(&self, stmt: StmtHandle, column_number: u16, target: CDataType) -> CellRead<i64>;
    fn get_f64(&self, stmt: StmtHandle, column_number: u16, target: CDataType) -> CellRead<f64>;
    fn get_bit(&self, stmt: StmtHandle, column_number: u16) -> CellRead<u8>;
    fn get_timestamp(&self, stmt: StmtHandle, column_number: u16) -> CellRead<TimestampValue>;
    fn get_date(&self, stmt: StmtHandle, column_number: u16) -> CellRead<DateValue>;
    fn get_time(&self, stmt: StmtHandle, column_number: u16) -> CellRead<TimeValue>;
    fn get_numeric(&self, stmt: StmtHandle, column_number: u16) -> CellRead<NumericValue>;

    /// Variable-length read into `buf`. Writes at most `buf.len()` bytes
    /// including one terminator unit; the indicator reports the bytes that
    /// remained available before this call, or null.
    fn get_text(
        &self,
        stmt: StmtHandle,
        column_number: u16,
        encoding: TextEncoding,
        buf: &mut [u8],
    ) -> (SqlReturn, Indicator);

    fn diagnostic(&self, handle: NativeHandle) -> Option<Diagnostic>;
}

pub type SharedDriver = Arc<dyn Driver>;

/// Convert a native failure into a typed error, pulling the handle's first
/// diagnostic record. Used at every point of detection.
pub fn driver_error(
    driver: &dyn Driver,
    handle: NativeHandle,
    context: &str,
) -> crate::error::AodbcError {
    match driver.diagnostic(handle) {
        Some(diag) => crate::error::AodbcError::Driver {
            context: context.to_string(),
            sqlstate: diag.sqlstate,
            native_code: diag.native_code,
            message: diag.message,
        },
        None => crate::error::AodbcError::Driver {
            context: context.to_string(),
            sqlstate: [0u8; 5],
            native_code: 0,
            message: "an unknown error in the native call".to_string(),
        },
    }
}

/// UTF-16 encoding used for DSN and query text handed to the wide verbs.
pub fn to_wide(text: &str) -> Vec<u16> {
    text.encode_utf16().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_return_succeeded() {
        assert!(SqlReturn::Success.succeeded());
        assert!(SqlReturn::SuccessWithInfo.succeeded());
        assert!(!SqlReturn::StillExecuting.succeeded());
        assert!(!SqlReturn::Error.succeeded());
        assert!(!SqlReturn::NoData.succeeded());
    }

    #[test]
    fn test_sql_return_accepted_includes_still_executing() {
        assert!(SqlReturn::StillExecuting.accepted());
        assert!(SqlReturn::Success.accepted());
        assert!(!SqlReturn::Error.accepted());
    }

    #[test]
    fn test_indicator_null_sentinel() {
        assert!(Indicator::NULL_DATA.is_null());
        assert!(!Indicator(0).is_null());
        assert!(!Indicator(42).is_null());
    }

    #[test]
    fn test_c_type_tags_distinguish_bit_from_integer() {
        assert_ne!(CDataType::Bit.raw(), CDataType::Long.raw());
        assert_ne!(CDataType::Bit.raw(), CDataType::SBigInt.raw());
    }

    #[test]
    fn test_c_type_unsignedness() {
        assert!(CDataType::ULong.is_unsigned());
        assert!(CDataType::UBigInt.is_unsigned());
        assert!(!CDataType::Long.is_unsigned());
        assert!(!CDataType::Bit.is_unsigned());
    }

    #[test]
    fn test_text_encoding_units() {
        assert_eq!(TextEncoding::Narrow.unit(), 1);
        assert_eq!(TextEncoding::Wide.unit(), 2);
    }

    #[test]
    fn test_to_wide_round_trip() {
        let wide = to_wide("DSN=test");
        assert_eq!(String::from_utf16(&wide).unwrap(), "DSN=test");
    }

    #[test]
    fn test_numeric_default_is_positive_zero() {
        let n = NumericValue::default();
        assert_eq!(n.sign, 1);
        assert!(n.val.iter().all(|b| *b == 0));
    }
}
