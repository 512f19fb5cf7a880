//! Connection lifecycle: sessions and their pollable transitions.

use crate::config::{validate_timeout, Settings};
use crate::driver::{
    driver_error, to_wide, ConnHandle, EnvHandle, NativeHandle, SharedDriver, StmtHandle,
};
use crate::engine::operation::{AsyncOp, OpPoll};
use crate::engine::statement::Statement;
use crate::engine::PollState;
use crate::error::{AodbcError, Result};
use crate::signal::{CompletionSignal, WorkerSignal};
use log::{debug, warn};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// Connection lifecycle. Edges only move forward; the pending states own a
/// transition operation that a future drives to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    Disconnected,
    ToConnect,
    Connected,
    ToDisconnect,
}

pub(crate) struct SessionCore {
    driver: SharedDriver,
    settings: Settings,
    state: ConnectionState,
    env: Option<EnvHandle>,
    conn: Option<ConnHandle>,
    /// Concurrent statement limit reported by the driver at connect time.
    mca: u16,
    /// Statements currently between execute launch and fetch completion.
    outstanding: u16,
    /// Connect timeout in seconds; the disconnect is bounded by the same
    /// budget.
    timeout_secs: i64,
    transition: Option<AsyncOp>,
    pending_error: Option<AodbcError>,
}

pub(crate) type SharedSessionCore = Arc<Mutex<SessionCore>>;

pub(crate) fn lock_core(core: &Mutex<SessionCore>) -> Result<MutexGuard<'_, SessionCore>> {
    core.lock()
        .map_err(|_| AodbcError::InvalidState("the session lock was poisoned".to_string()))
}

impl SessionCore {
    pub(crate) fn driver(&self) -> SharedDriver {
        Arc::clone(&self.driver)
    }

    pub(crate) fn settings(&self) -> Settings {
        self.settings
    }

    /// Admit one more execute under the connection, or refuse. The check and
    /// the increment happen under one lock so concurrent statements cannot
    /// both slip past the limit.
    pub(crate) fn acquire_execute_slot(&mut self) -> Result<()> {
        if self.state != ConnectionState::Connected {
            return Err(AodbcError::InvalidState(
                "the session isn't connected".to_string(),
            ));
        }
        let limit = self.mca.max(1);
        if self.outstanding >= limit {
            return Err(AodbcError::ConcurrencyLimit { limit });
        }
        self.outstanding += 1;
        Ok(())
    }

    pub(crate) fn release_execute_slot(&mut self) {
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    fn alloc_statement(&self) -> Result<StmtHandle> {
        if self.state != ConnectionState::Connected {
            return Err(AodbcError::InvalidState(
                "the session isn't connected".to_string(),
            ));
        }
        match self.conn {
            Some(conn) => self.driver.alloc_stmt(conn),
            None => Err(AodbcError::InvalidState(
                "the session has no connection handle".to_string(),
            )),
        }
    }
}

/// A cloneable handle to one connection.
#[derive(Clone)]
pub struct Session {
    core: SharedSessionCore,
}

/// Begin connecting with default poll settings.
pub fn connect(driver: SharedDriver, dsn: &str, timeout_secs: i64) -> Result<ConnectFuture> {
    connect_with_settings(driver, dsn, timeout_secs, Settings::default())
}

/// Begin connecting. Allocates the environment and connection handles, sets
/// the login timeout, launches the native connect and returns a future that
/// finishes the transition. A timeout of zero waits indefinitely.
pub fn connect_with_settings(
    driver: SharedDriver,
    dsn: &str,
    timeout_secs: i64,
    settings: Settings,
) -> Result<ConnectFuture> {
    validate_timeout(timeout_secs)?;
    let env = driver.alloc_env()?;
    if !driver.set_odbc_version(env).succeeded() {
        driver.free_env(env);
        return Err(AodbcError::Configuration(
            "setting the ODBC version on the environment failed",
        ));
    }
    let conn = match driver.alloc_conn(env) {
        Ok(conn) => conn,
        Err(err) => {
            driver.free_env(env);
            return Err(err);
        }
    };
    if !driver.set_login_timeout(conn, timeout_secs).succeeded() {
        driver.free_conn(conn);
        driver.free_env(env);
        return Err(AodbcError::Configuration(
            "setting the login timeout failed",
        ));
    }

    let dsn_wide = to_wide(dsn);
    let signal = match launch_connect(&driver, conn, dsn_wide) {
        Ok(signal) => signal,
        Err(err) => {
            driver.free_conn(conn);
            driver.free_env(env);
            return Err(err);
        }
    };
    debug!("connect launched, timeout {timeout_secs}s");

    let core = SessionCore {
        driver,
        settings,
        state: ConnectionState::ToConnect,
        env: Some(env),
        conn: Some(conn),
        mca: 0,
        outstanding: 0,
        timeout_secs,
        transition: Some(AsyncOp::new(signal, settings, timeout_secs, "connect")),
        pending_error: None,
    };
    Ok(ConnectFuture {
        session: Session {
            core: Arc::new(Mutex::new(core)),
        },
    })
}

fn launch_connect(
    driver: &SharedDriver,
    conn: ConnHandle,
    dsn: Vec<u16>,
) -> Result<CompletionSignal> {
    if let Some(event) = driver.connection_event(conn)? {
        let rc = driver.connect(conn, &dsn);
        if !rc.accepted() {
            return Err(driver_error(
                driver.as_ref(),
                NativeHandle::Conn(conn),
                "connect::SQLDriverConnectW",
            ));
        }
        Ok(CompletionSignal::Native {
            event,
            handle: NativeHandle::Conn(conn),
        })
    } else {
        let worker_driver = Arc::clone(driver);
        Ok(CompletionSignal::Worker(WorkerSignal::spawn(move || {
            worker_driver.connect(conn, &dsn)
        })))
    }
}

impl Session {
    /// Open a statement under this connection.
    pub fn cursor(&self) -> Result<Statement> {
        let core = lock_core(&self.core)?;
        let stmt = core.alloc_statement()?;
        debug!("statement {} opened", stmt.0);
        Ok(Statement::new(
            Arc::downgrade(&self.core),
            core.driver(),
            core.settings(),
            stmt,
        ))
    }

    /// Begin disconnecting. Refused while another transition is in flight.
    /// The disconnect runs under the same timeout the connect used.
    pub fn close(&self) -> Result<CloseFuture> {
        let mut core = lock_core(&self.core)?;
        match core.state {
            ConnectionState::Disconnected => Err(AodbcError::InvalidState(
                "the connection is already disconnected".to_string(),
            )),
            ConnectionState::ToConnect => Err(AodbcError::InvalidState(
                "a connect is still in flight".to_string(),
            )),
            ConnectionState::ToDisconnect => Err(AodbcError::InvalidState(
                "a disconnect is already in flight".to_string(),
            )),
            ConnectionState::Connected => {
                let conn = match core.conn {
                    Some(conn) => conn,
                    None => {
                        return Err(AodbcError::InvalidState(
                            "the session has no connection handle".to_string(),
                        ))
                    }
                };
                let driver = core.driver();
                let signal = launch_disconnect(&driver, conn)?;
                debug!("disconnect launched");
                core.state = ConnectionState::ToDisconnect;
                let settings = core.settings;
                let timeout_secs = core.timeout_secs;
                core.transition =
                    Some(AsyncOp::new(signal, settings, timeout_secs, "disconnect"));
                Ok(CloseFuture {
                    core: Arc::clone(&self.core),
                })
            }
        }
    }

    /// Park an error so the next completed close re-raises it. Lets a caller
    /// tear the connection down first and still surface the original
    /// failure.
    pub fn defer_error(&self, err: AodbcError) -> Result<()> {
        let mut core = lock_core(&self.core)?;
        core.pending_error = Some(err);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        lock_core(&self.core)
            .map(|core| core.state == ConnectionState::Connected)
            .unwrap_or(false)
    }

    /// The concurrent statement limit reported by the driver, once connected.
    pub fn max_concurrent_statements(&self) -> u16 {
        lock_core(&self.core)
            .map(|core| core.mca.max(1))
            .unwrap_or(1)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock_core(&self.core).map(|core| core.state).ok();
        f.debug_struct("Session").field("state", &state).finish()
    }
}

fn launch_disconnect(driver: &SharedDriver, conn: ConnHandle) -> Result<CompletionSignal> {
    if let Some(event) = driver.connection_event(conn)? {
        let rc = driver.disconnect(conn);
        if !rc.accepted() {
            return Err(driver_error(
                driver.as_ref(),
                NativeHandle::Conn(conn),
                "disconnect::SQLDisconnect",
            ));
        }
        Ok(CompletionSignal::Native {
            event,
            handle: NativeHandle::Conn(conn),
        })
    } else {
        let worker_driver = Arc::clone(driver);
        Ok(CompletionSignal::Worker(WorkerSignal::spawn(move || {
            worker_driver.disconnect(conn)
        })))
    }
}

/// Pending connect transition; yields the connected [`Session`].
pub struct ConnectFuture {
    session: Session,
}

impl fmt::Debug for ConnectFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectFuture").finish_non_exhaustive()
    }
}

impl ConnectFuture {
    pub fn poll(&mut self) -> Result<PollState<Session>> {
        let mut core = lock_core(&self.session.core)?;
        if core.state != ConnectionState::ToConnect || core.transition.is_none() {
            return Err(AodbcError::AlreadyCompleted("connect"));
        }
        let driver = core.driver();
        let outcome = match core.transition.as_mut() {
            Some(op) => op.poll(driver.as_ref())?,
            None => return Err(AodbcError::AlreadyCompleted("connect")),
        };
        match outcome {
            OpPoll::Pending => Ok(PollState::Pending),
            OpPoll::Complete(rc) => {
                core.transition = None;
                if rc.succeeded() {
                    let conn = core.conn;
                    core.mca = conn
                        .and_then(|conn| driver.max_concurrent_activities(conn))
                        .unwrap_or_else(|| {
                            warn!("driver does not report a concurrency limit, assuming 1");
                            1
                        });
                    core.state = ConnectionState::Connected;
                    debug!("connected, concurrency limit {}", core.mca);
                    Ok(PollState::Ready(self.session.clone()))
                } else {
                    let err = match core.conn {
                        Some(conn) => driver_error(
                            driver.as_ref(),
                            NativeHandle::Conn(conn),
                            "connect::SQLDriverConnectW",
                        ),
                        None => AodbcError::InvalidState(
                            "the session has no connection handle".to_string(),
                        ),
                    };
                    if let Some(conn) = core.conn.take() {
                        driver.free_conn(conn);
                    }
                    if let Some(env) = core.env.take() {
                        driver.free_env(env);
                    }
                    core.state = ConnectionState::Disconnected;
                    Err(err)
                }
            }
        }
    }
}

/// Pending disconnect transition.
pub struct CloseFuture {
    core: SharedSessionCore,
}

impl fmt::Debug for CloseFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseFuture").finish_non_exhaustive()
    }
}

impl CloseFuture {
    pub fn poll(&mut self) -> Result<PollState<()>> {
        let mut core = lock_core(&self.core)?;
        if core.state != ConnectionState::ToDisconnect || core.transition.is_none() {
            return Err(AodbcError::AlreadyCompleted("disconnect"));
        }
        let driver = core.driver();
        let outcome = match core.transition.as_mut() {
            Some(op) => op.poll(driver.as_ref())?,
            None => return Err(AodbcError::AlreadyCompleted("disconnect")),
        };
        match outcome {
            OpPoll::Pending => Ok(PollState::Pending),
            OpPoll::Complete(rc) => {
                core.transition = None;
                if !rc.succeeded() {
                    // The connection is in an indeterminate state; keep the
                    // handles and report what the driver said.
                    let err = match core.conn {
                        Some(conn) => driver_error(
                            driver.as_ref(),
                            NativeHandle::Conn(conn),
                            "disconnect::SQLDisconnect",
                        ),
                        None => AodbcError::InvalidState(
                            "the session has no connection handle".to_string(),
                        ),
                    };
                    return Err(err);
                }
                if let Some(conn) = core.conn.take() {
                    if !driver.free_conn(conn).succeeded() {
                        warn!("freeing the connection handle failed");
                    }
                }
                if let Some(env) = core.env.take() {
                    if !driver.free_env(env).succeeded() {
                        warn!("freeing the environment handle failed");
                    }
                }
                core.mca = 0;
                core.outstanding = 0;
                core.state = ConnectionState::Disconnected;
                debug!("disconnected");
                if let Some(err) = core.pending_error.take() {
                    return Err(err);
                }
                Ok(PollState::Ready(()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::testing::ScriptedDriver;
    use crate::engine::drive;

    fn scripted() -> SharedDriver {
        Arc::new(ScriptedDriver::new())
    }

    fn connected(driver: &SharedDriver) -> Session {
        let mut fut = connect(Arc::clone(driver), "DSN=test", 0).expect("launch failed");
        drive(|| fut.poll()).expect("connect failed")
    }

    #[test]
    fn test_connect_yields_connected_session() {
        let driver = scripted();
        let session = connected(&driver);
        assert!(session.is_connected());
        assert_eq!(session.max_concurrent_statements(), 1);
    }

    #[test]
    fn test_connect_rejects_invalid_timeout() {
        let driver = scripted();
        assert!(connect(Arc::clone(&driver), "DSN=test", -1).is_err());
        assert!(connect(driver, "DSN=test", i64::MAX).is_err());
    }

    #[test]
    fn test_connect_failure_frees_handles() {
        let raw = Arc::new(ScriptedDriver::new());
        raw.fail_connect();
        let driver: SharedDriver = raw.clone();
        let mut fut = connect(driver, "DSN=bad", 0).expect("launch failed");
        let err = drive(|| fut.poll()).unwrap_err();
        assert!(matches!(err, AodbcError::Driver { .. }));
        assert_eq!(raw.live_handles(), 0);
    }

    #[test]
    fn test_poll_after_connect_completion() {
        let driver = scripted();
        let mut fut = connect(Arc::clone(&driver), "DSN=test", 0).expect("launch failed");
        drive(|| fut.poll()).expect("connect failed");
        assert!(matches!(
            fut.poll().unwrap_err(),
            AodbcError::AlreadyCompleted("connect")
        ));
    }

    #[test]
    fn test_cursor_requires_connected() {
        let driver = scripted();
        let session = connected(&driver);
        let mut close = session.close().expect("close launch failed");
        drive(|| close.poll()).expect("close failed");
        assert!(matches!(
            session.cursor().unwrap_err(),
            AodbcError::InvalidState(_)
        ));
    }

    #[test]
    fn test_close_frees_all_handles() {
        let raw = Arc::new(ScriptedDriver::new());
        let driver: SharedDriver = raw.clone();
        let session = connected(&driver);
        let mut close = session.close().expect("close launch failed");
        drive(|| close.poll()).expect("close failed");
        assert!(!session.is_connected());
        assert_eq!(raw.live_handles(), 0);
    }

    #[test]
    fn test_double_close_is_invalid() {
        let driver = scripted();
        let session = connected(&driver);
        let mut close = session.close().expect("close launch failed");
        drive(|| close.poll()).expect("close failed");
        let err = session.close().unwrap_err();
        match err {
            AodbcError::InvalidState(msg) => assert!(msg.contains("already disconnected")),
            other => panic!("expected InvalidState, got {other:?}"),
        }
    }

    #[test]
    fn test_close_during_connect_is_invalid() {
        let raw = ScriptedDriver::new();
        raw.set_connect_delay(std::time::Duration::from_millis(400));
        let driver: SharedDriver = Arc::new(raw);
        let fut = connect(Arc::clone(&driver), "DSN=test", 0).expect("launch failed");
        let session = fut.session.clone();
        assert!(matches!(
            session.close().unwrap_err(),
            AodbcError::InvalidState(_)
        ));
    }

    #[test]
    fn test_deferred_error_surfaces_after_close() {
        let driver = scripted();
        let session = connected(&driver);
        session
            .defer_error(AodbcError::Memory("a marshalling buffer allocation failed"))
            .unwrap();
        let mut close = session.close().expect("close launch failed");
        let err = drive(|| close.poll()).unwrap_err();
        assert!(matches!(err, AodbcError::Memory(_)));
        // The disconnect itself still completed.
        assert!(!session.is_connected());
    }

    #[test]
    fn test_disconnect_bounded_by_the_connect_timeout() {
        let raw = Arc::new(ScriptedDriver::new());
        let driver: SharedDriver = raw.clone();
        let mut fut = connect(driver, "DSN=test", 1).expect("launch failed");
        let session = drive(|| fut.poll()).expect("connect failed");
        raw.hang_disconnect();
        let mut close = session.close().expect("close launch failed");
        let err = drive(|| close.poll()).unwrap_err();
        assert!(matches!(
            err,
            AodbcError::Timeout {
                operation: "disconnect",
                ..
            }
        ));
    }

    #[test]
    fn test_session_and_close_future_are_debuggable() {
        let driver = scripted();
        let session = connected(&driver);
        assert!(format!("{session:?}").contains("Connected"));
        let close = session.close().expect("close launch failed");
        assert!(format!("{close:?}").contains("CloseFuture"));
    }

    #[test]
    fn test_session_reports_driver_concurrency_limit() {
        let raw = ScriptedDriver::new();
        raw.set_max_concurrent(Some(3));
        let driver: SharedDriver = Arc::new(raw);
        let session = connected(&driver);
        assert_eq!(session.max_concurrent_statements(), 3);
    }

    #[test]
    fn test_missing_concurrency_info_defaults_to_one() {
        let raw = ScriptedDriver::new();
        raw.set_max_concurrent(None);
        let driver: SharedDriver = Arc::new(raw);
        let session = connected(&driver);
        assert_eq!(session.max_concurrent_statements(), 1);
    }
}
