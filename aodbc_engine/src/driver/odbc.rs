//! Driver manager backend over the raw `odbc_api::sys` entry points.
//!
//! Handles are kept in an internal table keyed by u32 ids; the raw pointers
//! never cross the seam. Completion always runs in worker-thread emulation
//! here: the driver manager's native async support varies too much across
//! platforms to rely on, and the ODBC driver manager is documented
//! thread-safe, so blocking verbs may run on a worker while other calls
//! proceed on the caller thread.

use crate::codec::bind::{Parameter, ParameterPayload};
use crate::driver::{
    CDataType, CellRead, ColAttr, ColumnDescription, ConnHandle, DateValue, Diagnostic, Driver,
    EnvHandle, Indicator, NativeHandle, NumericValue, SqlDataType, SqlReturn, StmtHandle,
    TextEncoding, TimeValue, TimestampValue, MAX_NUMERIC_LEN,
};
use crate::error::{AodbcError, Result};
use crate::signal::WaitEvent;
use log::debug;
use odbc_api::sys;
use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr;
use std::sync::{Mutex, MutexGuard};

/// One bound parameter's pinned storage. The boxed allocations keep their
/// addresses while the table's vectors move.
enum OwnedPayload {
    None,
    Bytes(Box<[u8]>),
    Timestamp(Box<sys::Timestamp>),
    Date(Box<sys::Date>),
    Time(Box<sys::Time>),
}

struct BoundBuffer {
    payload: OwnedPayload,
    indicator: Box<isize>,
}

impl BoundBuffer {
    fn data_ptr(&mut self) -> sys::Pointer {
        match &mut self.payload {
            OwnedPayload::None => ptr::null_mut(),
            OwnedPayload::Bytes(bytes) => bytes.as_mut_ptr() as sys::Pointer,
            OwnedPayload::Timestamp(ts) => &mut **ts as *mut sys::Timestamp as sys::Pointer,
            OwnedPayload::Date(d) => &mut **d as *mut sys::Date as sys::Pointer,
            OwnedPayload::Time(t) => &mut **t as *mut sys::Time as sys::Pointer,
        }
    }

    fn data_len(&self) -> isize {
        match &self.payload {
            OwnedPayload::None => 0,
            OwnedPayload::Bytes(bytes) => bytes.len() as isize,
            OwnedPayload::Timestamp(_) => std::mem::size_of::<sys::Timestamp>() as isize,
            OwnedPayload::Date(_) => std::mem::size_of::<sys::Date>() as isize,
            OwnedPayload::Time(_) => std::mem::size_of::<sys::Time>() as isize,
        }
    }
}

#[derive(Default)]
struct HandleTable {
    next_id: u32,
    // Raw handles stored as usize so the table is Send.
    envs: HashMap<u32, usize>,
    conns: HashMap<u32, usize>,
    stmts: HashMap<u32, usize>,
    bound: HashMap<u32, Vec<BoundBuffer>>,
}

impl HandleTable {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }
}

/// [`Driver`] over the platform driver manager.
pub struct OdbcDriver {
    table: Mutex<HandleTable>,
}

impl Default for OdbcDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl OdbcDriver {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HandleTable::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HandleTable> {
        match self.table.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn env_ptr(&self, env: EnvHandle) -> Option<sys::HEnv> {
        self.lock().envs.get(&env.0).map(|p| sys::HEnv(*p as *mut c_void))
    }

    fn conn_ptr(&self, conn: ConnHandle) -> Option<sys::HDbc> {
        self.lock().conns.get(&conn.0).map(|p| sys::HDbc(*p as *mut c_void))
    }

    fn stmt_ptr(&self, stmt: StmtHandle) -> Option<sys::HStmt> {
        self.lock().stmts.get(&stmt.0).map(|p| sys::HStmt(*p as *mut c_void))
    }
}

fn ret(rc: sys::SqlReturn) -> SqlReturn {
    match rc {
        sys::SqlReturn::SUCCESS => SqlReturn::Success,
        sys::SqlReturn::SUCCESS_WITH_INFO => SqlReturn::SuccessWithInfo,
        sys::SqlReturn::NO_DATA => SqlReturn::NoData,
        sys::SqlReturn::STILL_EXECUTING => SqlReturn::StillExecuting,
        sys::SqlReturn::INVALID_HANDLE => SqlReturn::InvalidHandle,
        _ => SqlReturn::Error,
    }
}

fn c_type(tag: CDataType) -> sys::CDataType {
    match tag {
        CDataType::Char => sys::CDataType::Char,
        CDataType::WChar => sys::CDataType::WChar,
        CDataType::Long => sys::CDataType::SLong,
        CDataType::ULong => sys::CDataType::ULong,
        CDataType::SBigInt => sys::CDataType::SBigInt,
        CDataType::UBigInt => sys::CDataType::UBigInt,
        CDataType::STinyInt => sys::CDataType::STinyInt,
        CDataType::UTinyInt => sys::CDataType::UTinyInt,
        CDataType::Bit => sys::CDataType::Bit,
        CDataType::Float => sys::CDataType::Float,
        CDataType::Double => sys::CDataType::Double,
        CDataType::TypeDate => sys::CDataType::TypeDate,
        CDataType::TypeTime => sys::CDataType::TypeTime,
        CDataType::TypeTimestamp => sys::CDataType::TypeTimestamp,
        CDataType::Numeric => sys::CDataType::Numeric,
    }
}

fn sql_type(tag: SqlDataType) -> sys::SqlDataType {
    match tag {
        SqlDataType::INTEGER => sys::SqlDataType::INTEGER,
        SqlDataType::BIGINT => sys::SqlDataType::EXT_BIG_INT,
        SqlDataType::BIT => sys::SqlDataType::EXT_BIT,
        SqlDataType::DOUBLE => sys::SqlDataType::DOUBLE,
        SqlDataType::WVARCHAR => sys::SqlDataType::EXT_W_VARCHAR,
        SqlDataType::WLONGVARCHAR => sys::SqlDataType::EXT_W_LONG_VARCHAR,
        SqlDataType::TYPE_DATE => sys::SqlDataType::DATE,
        SqlDataType::TYPE_TIME => sys::SqlDataType::TIME,
        SqlDataType::TYPE_TIMESTAMP => sys::SqlDataType::TIMESTAMP,
        // The binder only emits the tags above plus VARCHAR for nulls.
        _ => sys::SqlDataType::VARCHAR,
    }
}

fn owned_payload(payload: &ParameterPayload) -> OwnedPayload {
    match payload {
        ParameterPayload::Null => OwnedPayload::None,
        ParameterPayload::Int32(v) => OwnedPayload::Bytes(Box::from(v.to_ne_bytes().as_slice())),
        ParameterPayload::Int64(v) => OwnedPayload::Bytes(Box::from(v.to_ne_bytes().as_slice())),
        ParameterPayload::Bit(v) => OwnedPayload::Bytes(Box::from([*v].as_slice())),
        ParameterPayload::Double(v) => OwnedPayload::Bytes(Box::from(v.to_ne_bytes().as_slice())),
        ParameterPayload::WideText(units) => {
            let mut bytes = Vec::with_capacity(units.len() * 2);
            for unit in units {
                bytes.extend_from_slice(&unit.to_ne_bytes());
            }
            OwnedPayload::Bytes(bytes.into_boxed_slice())
        }
        ParameterPayload::Timestamp(ts) => OwnedPayload::Timestamp(Box::new(sys::Timestamp {
            year: ts.year,
            month: ts.month,
            day: ts.day,
            hour: ts.hour,
            minute: ts.minute,
            second: ts.second,
            fraction: ts.fraction,
        })),
        ParameterPayload::Date(d) => OwnedPayload::Date(Box::new(sys::Date {
            year: d.year,
            month: d.month,
            day: d.day,
        })),
        ParameterPayload::Time(t) => OwnedPayload::Time(Box::new(sys::Time {
            hour: t.hour,
            minute: t.minute,
            second: t.second,
        })),
    }
}

/// Build a packed-decimal struct from the driver's character rendition of a
/// decimal cell. Keeps the value exact: the digits go into the magnitude
/// bytes untouched and the scale is taken from the text.
fn numeric_from_text(text: &str) -> Option<NumericValue> {
    let trimmed = text.trim();
    let (sign, digits_text) = match trimmed.strip_prefix('-') {
        Some(rest) => (0u8, rest),
        None => (1u8, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let (whole, fraction) = match digits_text.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (digits_text, ""),
    };
    // At least one digit is required.
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    let mut magnitude: u128 = 0;
    for ch in whole.chars().chain(fraction.chars()) {
        let digit = ch.to_digit(10)?;
        magnitude = magnitude.checked_mul(10)?.checked_add(u128::from(digit))?;
    }
    let mut val = [0u8; MAX_NUMERIC_LEN];
    let mut rest = magnitude;
    for slot in val.iter_mut() {
        *slot = (rest & 0xff) as u8;
        rest >>= 8;
    }
    if rest != 0 {
        return None;
    }
    Some(NumericValue {
        precision: (whole.len() + fraction.len()).min(u8::MAX as usize) as u8,
        scale: fraction.len().min(i8::MAX as usize) as i8,
        sign,
        val,
    })
}

fn empty_read<T: Default>() -> CellRead<T> {
    CellRead::new(SqlReturn::InvalidHandle, Indicator(0), T::default())
}

impl OdbcDriver {
    /// One fixed-width SQLGetData call into `storage`.
    fn raw_get_data(
        &self,
        stmt: StmtHandle,
        column_number: u16,
        target: sys::CDataType,
        storage: sys::Pointer,
        len: isize,
    ) -> (SqlReturn, Indicator) {
        let handle = match self.stmt_ptr(stmt) {
            Some(handle) => handle,
            None => return (SqlReturn::InvalidHandle, Indicator(0)),
        };
        let mut indicator: isize = 0;
        let rc = unsafe {
            sys::SQLGetData(handle, column_number, target, storage, len, &mut indicator)
        };
        (ret(rc), Indicator(indicator as i64))
    }

    fn fixed_read<T: Default>(
        &self,
        stmt: StmtHandle,
        column_number: u16,
        target: sys::CDataType,
        mut value: T,
    ) -> CellRead<T> {
        let size = std::mem::size_of::<T>() as isize;
        let (rc, indicator) = self.raw_get_data(
            stmt,
            column_number,
            target,
            &mut value as *mut T as sys::Pointer,
            size,
        );
        CellRead::new(rc, indicator, value)
    }
}

impl Driver for OdbcDriver {
    fn alloc_env(&self) -> Result<EnvHandle> {
        let mut raw = sys::Handle::null();
        let rc =
            unsafe { sys::SQLAllocHandle(sys::HandleType::Env, sys::Handle::null(), &mut raw) };
        if !ret(rc).succeeded() || raw.0.is_null() {
            return Err(AodbcError::Allocation(
                "allocating the environment handle failed",
            ));
        }
        let mut table = self.lock();
        let id = table.next_id();
        table.envs.insert(id, raw.0 as usize);
        Ok(EnvHandle(id))
    }

    fn set_odbc_version(&self, env: EnvHandle) -> SqlReturn {
        let handle = match self.env_ptr(env) {
            Some(handle) => handle,
            None => return SqlReturn::InvalidHandle,
        };
        let rc = unsafe {
            sys::SQLSetEnvAttr(
                handle,
                sys::EnvironmentAttribute::OdbcVersion,
                sys::AttrOdbcVersion::Odbc3.into(),
                0,
            )
        };
        ret(rc)
    }

    fn alloc_conn(&self, env: EnvHandle) -> Result<ConnHandle> {
        let parent = self
            .env_ptr(env)
            .ok_or(AodbcError::Allocation("unknown environment handle"))?;
        let mut raw = sys::Handle::null();
        let rc =
            unsafe { sys::SQLAllocHandle(sys::HandleType::Dbc, parent.as_handle(), &mut raw) };
        if !ret(rc).succeeded() || raw.0.is_null() {
            return Err(AodbcError::Allocation(
                "allocating the connection handle failed",
            ));
        }
        let mut table = self.lock();
        let id = table.next_id();
        table.conns.insert(id, raw.0 as usize);
        Ok(ConnHandle(id))
    }

    fn free_conn(&self, conn: ConnHandle) -> SqlReturn {
        let raw = match self.lock().conns.remove(&conn.0) {
            Some(raw) => raw,
            None => return SqlReturn::InvalidHandle,
        };
        ret(unsafe { sys::SQLFreeHandle(sys::HandleType::Dbc, sys::Handle(raw as *mut c_void)) })
    }

    fn free_env(&self, env: EnvHandle) -> SqlReturn {
        let raw = match self.lock().envs.remove(&env.0) {
            Some(raw) => raw,
            None => return SqlReturn::InvalidHandle,
        };
        ret(unsafe { sys::SQLFreeHandle(sys::HandleType::Env, sys::Handle(raw as *mut c_void)) })
    }

    fn alloc_stmt(&self, conn: ConnHandle) -> Result<StmtHandle> {
        let parent = self
            .conn_ptr(conn)
            .ok_or(AodbcError::Allocation("unknown connection handle"))?;
        let mut raw = sys::Handle::null();
        let rc =
            unsafe { sys::SQLAllocHandle(sys::HandleType::Stmt, parent.as_handle(), &mut raw) };
        if !ret(rc).succeeded() || raw.0.is_null() {
            return Err(AodbcError::Allocation(
                "allocating the statement handle failed",
            ));
        }
        let mut table = self.lock();
        let id = table.next_id();
        table.stmts.insert(id, raw.0 as usize);
        Ok(StmtHandle(id))
    }

    fn free_stmt(&self, stmt: StmtHandle) -> SqlReturn {
        let raw = {
            let mut table = self.lock();
            table.bound.remove(&stmt.0);
            match table.stmts.remove(&stmt.0) {
                Some(raw) => raw,
                None => return SqlReturn::InvalidHandle,
            }
        };
        ret(unsafe { sys::SQLFreeHandle(sys::HandleType::Stmt, sys::Handle(raw as *mut c_void)) })
    }

    fn set_login_timeout(&self, conn: ConnHandle, secs: i64) -> SqlReturn {
        let handle = match self.conn_ptr(conn) {
            Some(handle) => handle,
            None => return SqlReturn::InvalidHandle,
        };
        let rc = unsafe {
            sys::SQLSetConnectAttrW(
                handle,
                sys::ConnectionAttribute::LOGIN_TIMEOUT,
                secs as usize as sys::Pointer,
                0,
            )
        };
        ret(rc)
    }

    fn set_query_timeout(&self, stmt: StmtHandle, secs: i64) -> SqlReturn {
        let handle = match self.stmt_ptr(stmt) {
            Some(handle) => handle,
            None => return SqlReturn::InvalidHandle,
        };
        let rc = unsafe {
            sys::SQLSetStmtAttrW(
                handle,
                sys::StatementAttribute::QueryTimeout,
                secs as usize as sys::Pointer,
                0,
            )
        };
        ret(rc)
    }

    fn max_concurrent_activities(&self, conn: ConnHandle) -> Option<u16> {
        let handle = self.conn_ptr(conn)?;
        let mut value: u16 = 0;
        let rc = unsafe {
            sys::SQLGetInfoW(
                handle,
                sys::InfoType::MaxConcurrentActivities,
                &mut value as *mut u16 as sys::Pointer,
                0,
                ptr::null_mut(),
            )
        };
        // Zero means the driver imposes no specific limit.
        if ret(rc).succeeded() && value > 0 {
            Some(value)
        } else {
            None
        }
    }

    fn connection_event(&self, _conn: ConnHandle) -> Result<Option<Box<dyn WaitEvent>>> {
        Ok(None)
    }

    fn statement_event(&self, _stmt: StmtHandle) -> Result<Option<Box<dyn WaitEvent>>> {
        Ok(None)
    }

    fn complete_async(&self, _handle: NativeHandle) -> SqlReturn {
        // Never reached: this backend always selects worker emulation.
        SqlReturn::Error
    }

    fn connect(&self, conn: ConnHandle, dsn: &[u16]) -> SqlReturn {
        let handle = match self.conn_ptr(conn) {
            Some(handle) => handle,
            None => return SqlReturn::InvalidHandle,
        };
        debug!("SQLDriverConnectW, {} dsn units", dsn.len());
        let rc = unsafe {
            sys::SQLDriverConnectW(
                handle,
                ptr::null_mut(),
                dsn.as_ptr(),
                dsn.len() as i16,
                ptr::null_mut(),
                0,
                ptr::null_mut(),
                sys::DriverConnectOption::NoPrompt,
            )
        };
        ret(rc)
    }

    fn disconnect(&self, conn: ConnHandle) -> SqlReturn {
        let handle = match self.conn_ptr(conn) {
            Some(handle) => handle,
            None => return SqlReturn::InvalidHandle,
        };
        ret(unsafe { sys::SQLDisconnect(handle) })
    }

    fn execute(&self, stmt: StmtHandle, query: &[u16]) -> SqlReturn {
        let handle = match self.stmt_ptr(stmt) {
            Some(handle) => handle,
            None => return SqlReturn::InvalidHandle,
        };
        debug!("SQLExecDirectW, {} query units", query.len());
        ret(unsafe { sys::SQLExecDirectW(handle, query.as_ptr(), query.len() as i32) })
    }

    fn bind_parameter(&self, stmt: StmtHandle, number: u16, parameter: &Parameter) -> SqlReturn {
        let handle = match self.stmt_ptr(stmt) {
            Some(handle) => handle,
            None => return SqlReturn::InvalidHandle,
        };
        let mut buffer = BoundBuffer {
            payload: owned_payload(&parameter.payload),
            indicator: Box::new(parameter.indicator.0 as isize),
        };
        let rc = unsafe {
            sys::SQLBindParameter(
                handle,
                number,
                sys::ParamType::Input,
                c_type(parameter.c_type),
                sql_type(parameter.sql_type),
                parameter.column_size as usize,
                parameter.decimal_digits,
                buffer.data_ptr(),
                buffer.data_len(),
                &mut *buffer.indicator,
            )
        };
        if ret(rc).succeeded() {
            // Pin the storage until the parameters are reset or the
            // statement is freed.
            self.lock().bound.entry(stmt.0).or_default().push(buffer);
        }
        ret(rc)
    }

    fn reset_parameters(&self, stmt: StmtHandle) -> SqlReturn {
        let handle = match self.stmt_ptr(stmt) {
            Some(handle) => handle,
            None => return SqlReturn::InvalidHandle,
        };
        let rc = ret(unsafe { sys::SQLFreeStmt(handle, sys::FreeStmtOption::ResetParams) });
        if rc.succeeded() {
            self.lock().bound.remove(&stmt.0);
        }
        rc
    }

    fn num_result_cols(&self, stmt: StmtHandle) -> CellRead<i16> {
        let handle = match self.stmt_ptr(stmt) {
            Some(handle) => handle,
            None => return empty_read(),
        };
        let mut count: i16 = 0;
        let rc = unsafe { sys::SQLNumResultCols(handle, &mut count) };
        CellRead::new(ret(rc), Indicator(0), count)
    }

    fn fetch(&self, stmt: StmtHandle) -> SqlReturn {
        let handle = match self.stmt_ptr(stmt) {
            Some(handle) => handle,
            None => return SqlReturn::InvalidHandle,
        };
        ret(unsafe { sys::SQLFetch(handle) })
    }

    fn describe_col(&self, stmt: StmtHandle, column_number: u16) -> Result<ColumnDescription> {
        let handle = self
            .stmt_ptr(stmt)
            .ok_or(AodbcError::Allocation("unknown statement handle"))?;
        let mut name = [0u16; 256];
        let mut name_len: i16 = 0;
        let mut data_type = sys::SqlDataType::UNKNOWN_TYPE;
        let mut size: usize = 0;
        let mut decimal_digits: i16 = 0;
        let mut nullable: sys::Nullability = sys::Nullability::UNKNOWN;
        let rc = unsafe {
            sys::SQLDescribeColW(
                handle,
                column_number,
                name.as_mut_ptr(),
                name.len() as i16,
                &mut name_len,
                &mut data_type,
                &mut size,
                &mut decimal_digits,
                &mut nullable,
            )
        };
        if !ret(rc).succeeded() {
            return Err(AodbcError::Allocation("describing a column failed"));
        }
        let name_units = (name_len as usize).min(name.len());
        Ok(ColumnDescription {
            name: String::from_utf16_lossy(&name[..name_units]),
            sql_type: SqlDataType(data_type.0),
            size: size as u64,
            decimal_digits,
            nullable: nullable != sys::Nullability::NO_NULLS,
        })
    }

    fn col_attribute(&self, stmt: StmtHandle, column_number: u16, attr: ColAttr) -> CellRead<i64> {
        let handle = match self.stmt_ptr(stmt) {
            Some(handle) => handle,
            None => return empty_read(),
        };
        let field = match attr {
            ColAttr::Unsigned => sys::Desc::Unsigned,
            ColAttr::Precision => sys::Desc::Precision,
            ColAttr::Scale => sys::Desc::Scale,
        };
        let mut value: isize = 0;
        let rc = unsafe {
            sys::SQLColAttributeW(
                handle,
                column_number,
                field,
                ptr::null_mut(),
                0,
                ptr::null_mut(),
                &mut value,
            )
        };
        CellRead::new(ret(rc), Indicator(0), value as i64)
    }

    fn set_numeric_descriptor(
        &self,
        _stmt: StmtHandle,
        _column_number: u16,
        _precision: i64,
        _scale: i64,
    ) -> SqlReturn {
        // This backend reads decimals through their character rendition, so
        // no row descriptor adjustment is needed.
        SqlReturn::Success
    }

    fn get_int(&self, stmt: StmtHandle, column_number: u16, target: CDataType) -> CellRead<i64> {
        match target {
            CDataType::SBigInt => self.fixed_read::<i64>(stmt, column_number, c_type(target), 0),
            CDataType::UBigInt => {
                let read = self.fixed_read::<u64>(stmt, column_number, c_type(target), 0);
                CellRead::new(read.rc, read.indicator, read.value as i64)
            }
            CDataType::ULong => {
                let read = self.fixed_read::<u32>(stmt, column_number, c_type(target), 0);
                CellRead::new(read.rc, read.indicator, i64::from(read.value))
            }
            CDataType::STinyInt => {
                let read = self.fixed_read::<i8>(stmt, column_number, c_type(target), 0);
                CellRead::new(read.rc, read.indicator, i64::from(read.value))
            }
            CDataType::UTinyInt => {
                let read = self.fixed_read::<u8>(stmt, column_number, c_type(target), 0);
                CellRead::new(read.rc, read.indicator, i64::from(read.value))
            }
            _ => {
                let read =
                    self.fixed_read::<i32>(stmt, column_number, sys::CDataType::SLong, 0);
                CellRead::new(read.rc, read.indicator, i64::from(read.value))
            }
        }
    }

    fn get_f64(&self, stmt: StmtHandle, column_number: u16, _target: CDataType) -> CellRead<f64> {
        self.fixed_read::<f64>(stmt, column_number, sys::CDataType::Double, 0.0)
    }

    fn get_bit(&self, stmt: StmtHandle, column_number: u16) -> CellRead<u8> {
        self.fixed_read::<u8>(stmt, column_number, sys::CDataType::Bit, 0)
    }

    fn get_timestamp(&self, stmt: StmtHandle, column_number: u16) -> CellRead<TimestampValue> {
        let mut value = sys::Timestamp::default();
        let (rc, indicator) = self.raw_get_data(
            stmt,
            column_number,
            sys::CDataType::TypeTimestamp,
            &mut value as *mut sys::Timestamp as sys::Pointer,
            std::mem::size_of::<sys::Timestamp>() as isize,
        );
        CellRead::new(
            rc,
            indicator,
            TimestampValue {
                year: value.year,
                month: value.month,
                day: value.day,
                hour: value.hour,
                minute: value.minute,
                second: value.second,
                fraction: value.fraction,
            },
        )
    }

    fn get_date(&self, stmt: StmtHandle, column_number: u16) -> CellRead<DateValue> {
        let mut value = sys::Date::default();
        let (rc, indicator) = self.raw_get_data(
            stmt,
            column_number,
            sys::CDataType::TypeDate,
            &mut value as *mut sys::Date as sys::Pointer,
            std::mem::size_of::<sys::Date>() as isize,
        );
        CellRead::new(
            rc,
            indicator,
            DateValue {
                year: value.year,
                month: value.month,
                day: value.day,
            },
        )
    }

    fn get_time(&self, stmt: StmtHandle, column_number: u16) -> CellRead<TimeValue> {
        let mut value = sys::Time::default();
        let (rc, indicator) = self.raw_get_data(
            stmt,
            column_number,
            sys::CDataType::TypeTime,
            &mut value as *mut sys::Time as sys::Pointer,
            std::mem::size_of::<sys::Time>() as isize,
        );
        CellRead::new(
            rc,
            indicator,
            TimeValue {
                hour: value.hour,
                minute: value.minute,
                second: value.second,
            },
        )
    }

    fn get_numeric(&self, stmt: StmtHandle, column_number: u16) -> CellRead<NumericValue> {
        // Decimal digits arrive exactly in character form regardless of the
        // driver's numeric descriptor defaults.
        let mut buf = [0u8; 128];
        let (rc, indicator) = self.raw_get_data(
            stmt,
            column_number,
            sys::CDataType::Char,
            buf.as_mut_ptr() as sys::Pointer,
            buf.len() as isize,
        );
        if !rc.succeeded() || indicator.is_null() {
            return CellRead::new(rc, indicator, NumericValue::default());
        }
        let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
        let text = String::from_utf8_lossy(&buf[..end]);
        match numeric_from_text(&text) {
            Some(value) => CellRead::new(rc, indicator, value),
            None => CellRead::new(SqlReturn::Error, indicator, NumericValue::default()),
        }
    }

    fn get_text(
        &self,
        stmt: StmtHandle,
        column_number: u16,
        encoding: TextEncoding,
        buf: &mut [u8],
    ) -> (SqlReturn, Indicator) {
        let target = match encoding {
            TextEncoding::Narrow => sys::CDataType::Char,
            TextEncoding::Wide => sys::CDataType::WChar,
        };
        self.raw_get_data(
            stmt,
            column_number,
            target,
            buf.as_mut_ptr() as sys::Pointer,
            buf.len() as isize,
        )
    }

    fn diagnostic(&self, handle: NativeHandle) -> Option<Diagnostic> {
        let (handle_type, raw) = match handle {
            NativeHandle::Conn(conn) => (sys::HandleType::Dbc, self.conn_ptr(conn)?.as_handle()),
            NativeHandle::Stmt(stmt) => (sys::HandleType::Stmt, self.stmt_ptr(stmt)?.as_handle()),
        };
        let mut state = [0u16; 6];
        let mut native_code: i32 = 0;
        let mut message = [0u16; 1024];
        let mut message_len: i16 = 0;
        let rc = unsafe {
            sys::SQLGetDiagRecW(
                handle_type,
                raw,
                1,
                state.as_mut_ptr(),
                &mut native_code,
                message.as_mut_ptr(),
                message.len() as i16,
                &mut message_len,
            )
        };
        if !ret(rc).succeeded() {
            return None;
        }
        let mut sqlstate = [0u8; 5];
        for (slot, unit) in sqlstate.iter_mut().zip(state.iter()) {
            *slot = u8::try_from(*unit).unwrap_or(b'?');
        }
        let message_units = (message_len as usize).min(message.len());
        Some(Diagnostic {
            sqlstate,
            native_code,
            message: String::from_utf16_lossy(&message[..message_units]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_from_text() {
        let n = numeric_from_text("123.45").unwrap();
        assert_eq!(n.sign, 1);
        assert_eq!(n.scale, 2);
        assert_eq!(n.val[0], 0x39);
        assert_eq!(n.val[1], 0x30);

        let n = numeric_from_text("-0.5").unwrap();
        assert_eq!(n.sign, 0);
        assert_eq!(n.scale, 1);
        assert_eq!(n.val[0], 5);
    }

    #[test]
    fn test_numeric_from_text_rejects_garbage() {
        assert!(numeric_from_text("abc").is_none());
        assert!(numeric_from_text("").is_none());
        assert!(numeric_from_text(".").is_none());
        assert!(numeric_from_text("-").is_none());
    }
}
