//! Scripted in-memory driver for tests.
//!
//! Every call is recorded by name; results, latencies and failures are
//! programmable per driver instance. `get_text` serves cells in chunks
//! honoring the indicator contract, so the growing-buffer decode path is
//! exercised exactly as a real driver would.

use crate::codec::bind::Parameter;
use crate::driver::{
    CDataType, CellRead, ColAttr, ColumnDescription, ConnHandle, DateValue, Diagnostic, Driver,
    EnvHandle, Indicator, NativeHandle, NumericValue, SqlDataType, SqlReturn, StmtHandle,
    TextEncoding, TimeValue, TimestampValue,
};
use crate::error::{AodbcError, Result};
use crate::signal::WaitEvent;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

/// Column of a scripted result set.
#[derive(Debug, Clone)]
pub struct ScriptedColumn {
    pub name: String,
    pub sql_type: SqlDataType,
    pub size: u64,
    pub decimal_digits: i16,
    pub unsigned: bool,
    pub precision: i64,
    pub scale: i64,
}

impl ScriptedColumn {
    pub fn typed(name: &str, sql_type: SqlDataType) -> Self {
        Self {
            name: name.to_string(),
            sql_type,
            size: 0,
            decimal_digits: 0,
            unsigned: false,
            precision: 0,
            scale: 0,
        }
    }

    pub fn integer(name: &str) -> Self {
        Self::typed(name, SqlDataType::INTEGER)
    }

    pub fn bigint(name: &str) -> Self {
        Self::typed(name, SqlDataType::BIGINT)
    }

    pub fn bit(name: &str) -> Self {
        Self::typed(name, SqlDataType::BIT)
    }

    pub fn double(name: &str) -> Self {
        Self::typed(name, SqlDataType::DOUBLE)
    }

    pub fn timestamp(name: &str) -> Self {
        Self::typed(name, SqlDataType::TYPE_TIMESTAMP)
    }

    pub fn date(name: &str) -> Self {
        Self::typed(name, SqlDataType::TYPE_DATE)
    }

    pub fn time(name: &str) -> Self {
        Self::typed(name, SqlDataType::TYPE_TIME)
    }

    pub fn decimal(name: &str, precision: i64, scale: i64) -> Self {
        let mut column = Self::typed(name, SqlDataType::DECIMAL);
        column.precision = precision;
        column.scale = scale;
        column.decimal_digits = scale as i16;
        column
    }

    pub fn narrow_text(name: &str) -> Self {
        Self::typed(name, SqlDataType::VARCHAR)
    }

    pub fn wide_text(name: &str) -> Self {
        Self::typed(name, SqlDataType::WVARCHAR)
    }

    pub fn unsigned(mut self) -> Self {
        self.unsigned = true;
        self
    }
}

/// Cell of a scripted result set.
#[derive(Debug, Clone)]
pub enum ScriptedCell {
    Null,
    Int(i64),
    Double(f64),
    Bit(u8),
    Text(String),
    Timestamp(TimestampValue),
    Date(DateValue),
    Time(TimeValue),
    Numeric(NumericValue),
}

#[derive(Default)]
struct Inner {
    next_handle: u32,
    live_envs: usize,
    live_conns: usize,
    live_stmts: usize,
    columns: Vec<ScriptedColumn>,
    rows: Vec<Vec<ScriptedCell>>,
    /// Row position per statement; 0 means before the first row.
    positions: HashMap<u32, usize>,
    /// Bytes already served per (statement, column) text read.
    text_offsets: HashMap<(u32, u16), usize>,
    /// Encoding of every text read, in call order.
    text_encodings: Vec<TextEncoding>,
    max_concurrent: Option<u16>,
    connect_delay: Duration,
    execute_delay: Duration,
    hang_connect: bool,
    hang_execute: bool,
    hang_disconnect: bool,
    fail_connect: bool,
    fail_execute: bool,
    fail_get_data: bool,
    fail_bind_at: Option<usize>,
    bind_calls: usize,
    recorded_binds: Vec<Parameter>,
    calls: Vec<&'static str>,
}

/// Programmable in-memory [`Driver`].
pub struct ScriptedDriver {
    inner: Mutex<Inner>,
}

impl Default for ScriptedDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                max_concurrent: Some(1),
                ..Inner::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("scripted driver state poisoned")
    }

    fn record(&self, call: &'static str) {
        self.lock().calls.push(call);
    }

    /// Script the result set served after the next execute.
    pub fn set_result(&self, columns: Vec<ScriptedColumn>, rows: Vec<Vec<ScriptedCell>>) {
        let mut inner = self.lock();
        inner.columns = columns;
        inner.rows = rows;
    }

    pub fn set_max_concurrent(&self, limit: Option<u16>) {
        self.lock().max_concurrent = limit;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.lock().connect_delay = delay;
    }

    pub fn set_execute_delay(&self, delay: Duration) {
        self.lock().execute_delay = delay;
    }

    /// Make connect block far beyond any test timeout.
    pub fn hang_connect(&self) {
        self.lock().hang_connect = true;
    }

    /// Make execute block far beyond any test timeout.
    pub fn hang_execute(&self) {
        self.lock().hang_execute = true;
    }

    /// Make disconnect block far beyond any test timeout.
    pub fn hang_disconnect(&self) {
        self.lock().hang_disconnect = true;
    }

    pub fn fail_connect(&self) {
        self.lock().fail_connect = true;
    }

    pub fn fail_execute(&self) {
        self.lock().fail_execute = true;
    }

    pub fn fail_get_data(&self) {
        self.lock().fail_get_data = true;
    }

    /// Fail the nth bind_parameter call (1-based, counted across the
    /// driver's lifetime).
    pub fn fail_bind_at(&self, nth: usize) {
        self.lock().fail_bind_at = Some(nth);
    }

    pub fn clear_failures(&self) {
        let mut inner = self.lock();
        inner.fail_connect = false;
        inner.fail_execute = false;
        inner.fail_get_data = false;
        inner.fail_bind_at = None;
        inner.hang_connect = false;
        inner.hang_execute = false;
        inner.hang_disconnect = false;
    }

    /// The encoding of every text read so far, in call order.
    pub fn recorded_text_encodings(&self) -> Vec<TextEncoding> {
        self.lock().text_encodings.clone()
    }

    /// Parameters the driver accepted, with the wire tags it observed.
    pub fn recorded_binds(&self) -> Vec<Parameter> {
        self.lock().recorded_binds.clone()
    }

    /// How many times the named trait method ran.
    pub fn calls_named(&self, name: &str) -> usize {
        self.lock().calls.iter().filter(|call| **call == name).count()
    }

    /// Handles allocated and not yet freed, across all three kinds.
    pub fn live_handles(&self) -> usize {
        let inner = self.lock();
        inner.live_envs + inner.live_conns + inner.live_stmts
    }

    /// Allocate an env, a connection and a statement in one step; for tests
    /// that exercise the codec below the session layer.
    pub fn open_stmt(&self) -> StmtHandle {
        let env = self.alloc_env().expect("scripted env allocation failed");
        let conn = self
            .alloc_conn(env)
            .expect("scripted conn allocation failed");
        self.alloc_stmt(conn)
            .expect("scripted stmt allocation failed")
    }

    fn next_id(inner: &mut Inner) -> u32 {
        inner.next_handle += 1;
        inner.next_handle
    }

    fn current_cell(inner: &Inner, stmt: StmtHandle, column_number: u16) -> Option<ScriptedCell> {
        let position = *inner.positions.get(&stmt.0)?;
        if position == 0 {
            return None;
        }
        inner
            .rows
            .get(position - 1)
            .and_then(|row| row.get(column_number as usize - 1))
            .cloned()
    }

    fn typed_read<T: Default>(
        &self,
        call: &'static str,
        stmt: StmtHandle,
        column_number: u16,
        extract: impl FnOnce(ScriptedCell) -> Option<T>,
    ) -> CellRead<T> {
        self.record(call);
        let inner = self.lock();
        if inner.fail_get_data {
            return CellRead::new(SqlReturn::Error, Indicator(0), T::default());
        }
        match Self::current_cell(&inner, stmt, column_number) {
            Some(ScriptedCell::Null) => {
                CellRead::new(SqlReturn::Success, Indicator::NULL_DATA, T::default())
            }
            Some(cell) => match extract(cell) {
                Some(value) => {
                    CellRead::new(SqlReturn::Success, Indicator(std::mem::size_of::<T>() as i64), value)
                }
                None => CellRead::new(SqlReturn::Error, Indicator(0), T::default()),
            },
            None => CellRead::new(SqlReturn::Error, Indicator(0), T::default()),
        }
    }
}

impl Driver for ScriptedDriver {
    fn alloc_env(&self) -> Result<EnvHandle> {
        self.record("alloc_env");
        let mut inner = self.lock();
        let id = Self::next_id(&mut inner);
        inner.live_envs += 1;
        Ok(EnvHandle(id))
    }

    fn set_odbc_version(&self, _env: EnvHandle) -> SqlReturn {
        self.record("set_odbc_version");
        SqlReturn::Success
    }

    fn alloc_conn(&self, _env: EnvHandle) -> Result<ConnHandle> {
        self.record("alloc_conn");
        let mut inner = self.lock();
        let id = Self::next_id(&mut inner);
        inner.live_conns += 1;
        Ok(ConnHandle(id))
    }

    fn free_conn(&self, _conn: ConnHandle) -> SqlReturn {
        self.record("free_conn");
        let mut inner = self.lock();
        inner.live_conns = inner.live_conns.saturating_sub(1);
        SqlReturn::Success
    }

    fn free_env(&self, _env: EnvHandle) -> SqlReturn {
        self.record("free_env");
        let mut inner = self.lock();
        inner.live_envs = inner.live_envs.saturating_sub(1);
        SqlReturn::Success
    }

    fn alloc_stmt(&self, _conn: ConnHandle) -> Result<StmtHandle> {
        self.record("alloc_stmt");
        let mut inner = self.lock();
        let id = Self::next_id(&mut inner);
        inner.live_stmts += 1;
        Ok(StmtHandle(id))
    }

    fn free_stmt(&self, stmt: StmtHandle) -> SqlReturn {
        self.record("free_stmt");
        let mut inner = self.lock();
        inner.live_stmts = inner.live_stmts.saturating_sub(1);
        inner.positions.remove(&stmt.0);
        SqlReturn::Success
    }

    fn set_login_timeout(&self, _conn: ConnHandle, _secs: i64) -> SqlReturn {
        self.record("set_login_timeout");
        SqlReturn::Success
    }

    fn set_query_timeout(&self, _stmt: StmtHandle, _secs: i64) -> SqlReturn {
        self.record("set_query_timeout");
        SqlReturn::Success
    }

    fn max_concurrent_activities(&self, _conn: ConnHandle) -> Option<u16> {
        self.record("max_concurrent_activities");
        self.lock().max_concurrent
    }

    fn connection_event(&self, _conn: ConnHandle) -> Result<Option<Box<dyn WaitEvent>>> {
        self.record("connection_event");
        // Worker-thread emulation only.
        Ok(None)
    }

    fn statement_event(&self, _stmt: StmtHandle) -> Result<Option<Box<dyn WaitEvent>>> {
        self.record("statement_event");
        Ok(None)
    }

    fn complete_async(&self, _handle: NativeHandle) -> SqlReturn {
        self.record("complete_async");
        SqlReturn::Error
    }

    fn connect(&self, _conn: ConnHandle, _dsn: &[u16]) -> SqlReturn {
        self.record("connect");
        let (delay, hang, fail) = {
            let inner = self.lock();
            (inner.connect_delay, inner.hang_connect, inner.fail_connect)
        };
        if hang {
            thread::sleep(Duration::from_secs(600));
        } else if !delay.is_zero() {
            thread::sleep(delay);
        }
        if fail {
            SqlReturn::Error
        } else {
            SqlReturn::Success
        }
    }

    fn disconnect(&self, _conn: ConnHandle) -> SqlReturn {
        self.record("disconnect");
        let hang = self.lock().hang_disconnect;
        if hang {
            thread::sleep(Duration::from_secs(600));
        }
        SqlReturn::Success
    }

    fn execute(&self, stmt: StmtHandle, _query: &[u16]) -> SqlReturn {
        self.record("execute");
        let (delay, hang, fail) = {
            let mut inner = self.lock();
            inner.positions.insert(stmt.0, 0);
            inner
                .text_offsets
                .retain(|(owner, _), _| *owner != stmt.0);
            (inner.execute_delay, inner.hang_execute, inner.fail_execute)
        };
        if hang {
            thread::sleep(Duration::from_secs(600));
        } else if !delay.is_zero() {
            thread::sleep(delay);
        }
        if fail {
            SqlReturn::Error
        } else {
            SqlReturn::Success
        }
    }

    fn bind_parameter(&self, _stmt: StmtHandle, _number: u16, parameter: &Parameter) -> SqlReturn {
        self.record("bind_parameter");
        let mut inner = self.lock();
        inner.bind_calls += 1;
        if inner.fail_bind_at == Some(inner.bind_calls) {
            return SqlReturn::Error;
        }
        inner.recorded_binds.push(parameter.clone());
        SqlReturn::Success
    }

    fn reset_parameters(&self, _stmt: StmtHandle) -> SqlReturn {
        self.record("reset_parameters");
        SqlReturn::Success
    }

    fn num_result_cols(&self, _stmt: StmtHandle) -> CellRead<i16> {
        self.record("num_result_cols");
        let inner = self.lock();
        CellRead::new(
            SqlReturn::Success,
            Indicator(0),
            inner.columns.len() as i16,
        )
    }

    fn fetch(&self, stmt: StmtHandle) -> SqlReturn {
        self.record("fetch");
        let mut inner = self.lock();
        let total = inner.rows.len();
        let position = inner.positions.entry(stmt.0).or_insert(0);
        if *position >= total {
            return SqlReturn::NoData;
        }
        *position += 1;
        inner
            .text_offsets
            .retain(|(owner, _), _| *owner != stmt.0);
        SqlReturn::Success
    }

    fn describe_col(&self, _stmt: StmtHandle, column_number: u16) -> Result<ColumnDescription> {
        self.record("describe_col");
        let inner = self.lock();
        let column = inner
            .columns
            .get(column_number as usize - 1)
            .ok_or(AodbcError::Allocation("no such scripted column"))?;
        Ok(ColumnDescription {
            name: column.name.clone(),
            sql_type: column.sql_type,
            size: column.size,
            decimal_digits: column.decimal_digits,
            nullable: true,
        })
    }

    fn col_attribute(&self, _stmt: StmtHandle, column_number: u16, attr: ColAttr) -> CellRead<i64> {
        self.record("col_attribute");
        let inner = self.lock();
        match inner.columns.get(column_number as usize - 1) {
            Some(column) => {
                let value = match attr {
                    ColAttr::Unsigned => i64::from(column.unsigned),
                    ColAttr::Precision => column.precision,
                    ColAttr::Scale => column.scale,
                };
                CellRead::new(SqlReturn::Success, Indicator(0), value)
            }
            None => CellRead::new(SqlReturn::Error, Indicator(0), 0),
        }
    }

    fn set_numeric_descriptor(
        &self,
        _stmt: StmtHandle,
        _column_number: u16,
        _precision: i64,
        _scale: i64,
    ) -> SqlReturn {
        self.record("set_numeric_descriptor");
        SqlReturn::Success
    }

    fn get_int(&self, stmt: StmtHandle, column_number: u16, _target: CDataType) -> CellRead<i64> {
        self.typed_read("get_int", stmt, column_number, |cell| match cell {
            ScriptedCell::Int(v) => Some(v),
            _ => None,
        })
    }

    fn get_f64(&self, stmt: StmtHandle, column_number: u16, _target: CDataType) -> CellRead<f64> {
        self.typed_read("get_f64", stmt, column_number, |cell| match cell {
            ScriptedCell::Double(v) => Some(v),
            _ => None,
        })
    }

    fn get_bit(&self, stmt: StmtHandle, column_number: u16) -> CellRead<u8> {
        self.typed_read("get_bit", stmt, column_number, |cell| match cell {
            ScriptedCell::Bit(v) => Some(v),
            _ => None,
        })
    }

    fn get_timestamp(&self, stmt: StmtHandle, column_number: u16) -> CellRead<TimestampValue> {
        self.typed_read("get_timestamp", stmt, column_number, |cell| match cell {
            ScriptedCell::Timestamp(v) => Some(v),
            _ => None,
        })
    }

    fn get_date(&self, stmt: StmtHandle, column_number: u16) -> CellRead<DateValue> {
        self.typed_read("get_date", stmt, column_number, |cell| match cell {
            ScriptedCell::Date(v) => Some(v),
            _ => None,
        })
    }

    fn get_time(&self, stmt: StmtHandle, column_number: u16) -> CellRead<TimeValue> {
        self.typed_read("get_time", stmt, column_number, |cell| match cell {
            ScriptedCell::Time(v) => Some(v),
            _ => None,
        })
    }

    fn get_numeric(&self, stmt: StmtHandle, column_number: u16) -> CellRead<NumericValue> {
        self.typed_read("get_numeric", stmt, column_number, |cell| match cell {
            ScriptedCell::Numeric(v) => Some(v),
            _ => None,
        })
    }

    fn get_text(
        &self,
        stmt: StmtHandle,
        column_number: u16,
        encoding: TextEncoding,
        buf: &mut [u8],
    ) -> (SqlReturn, Indicator) {
        self.record("get_text");
        let mut inner = self.lock();
        inner.text_encodings.push(encoding);
        if inner.fail_get_data {
            return (SqlReturn::Error, Indicator(0));
        }
        let cell = match Self::current_cell(&inner, stmt, column_number) {
            Some(cell) => cell,
            None => return (SqlReturn::Error, Indicator(0)),
        };
        let text = match cell {
            ScriptedCell::Null => return (SqlReturn::Success, Indicator::NULL_DATA),
            ScriptedCell::Text(text) => text,
            _ => return (SqlReturn::Error, Indicator(0)),
        };
        let unit = encoding.unit();
        let bytes: Vec<u8> = match encoding {
            TextEncoding::Narrow => text.into_bytes(),
            TextEncoding::Wide => text
                .encode_utf16()
                .flat_map(|u| u.to_le_bytes())
                .collect(),
        };
        let consumed = inner
            .text_offsets
            .get(&(stmt.0, column_number))
            .copied()
            .unwrap_or(0);
        let remaining = bytes.len() - consumed;
        let capacity_units = buf.len() / unit;
        if capacity_units == 0 {
            return (SqlReturn::Error, Indicator(0));
        }
        let data_capacity = (capacity_units - 1) * unit;
        let written = remaining.min(data_capacity);
        buf[..written].copy_from_slice(&bytes[consumed..consumed + written]);
        for slot in buf[written..written + unit].iter_mut() {
            *slot = 0;
        }
        inner
            .text_offsets
            .insert((stmt.0, column_number), consumed + written);
        let rc = if remaining > data_capacity {
            SqlReturn::SuccessWithInfo
        } else {
            SqlReturn::Success
        };
        // Bytes that remained before this call.
        (rc, Indicator(remaining as i64))
    }

    fn diagnostic(&self, _handle: NativeHandle) -> Option<Diagnostic> {
        self.record("diagnostic");
        Some(Diagnostic {
            sqlstate: *b"HY000",
            native_code: 1,
            message: "scripted failure".to_string(),
        })
    }
}
