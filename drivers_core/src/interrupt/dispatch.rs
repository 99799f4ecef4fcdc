//! Two-phase dispatch of interrupts to connected service routines.
//!
//! A fast service routine runs directly from [`Dispatcher::dispatch`] at the interrupt's run
//! level. If it claims the interrupt and its connection also has a deferred worker, the worker is
//! queued and later run by [`Dispatcher::run_deferred`] at low run level.

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU32, Ordering};

use arc_swap::ArcSwap;
use crossbeam::queue::SegQueue;
use hashbrown::HashMap;
use log::{debug, trace};
use snafu::Snafu;

use super::{InterruptCause, InterruptSource, InterruptStatus, Line};

/// A service routine invoked with interrupts delivered.
pub type ServiceRoutine = Arc<dyn Fn() -> InterruptStatus + Send + Sync>;

/// The routines connected to a line.
#[derive(Clone, Default)]
pub struct Connection {
    /// Runs at interrupt run level. Must not block.
    pub service: Option<ServiceRoutine>,
    /// Runs later at low run level. May block.
    pub worker: Option<ServiceRoutine>,
}

impl core::fmt::Debug for Connection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Connection")
            .field("service", &self.service.is_some())
            .field("worker", &self.worker.is_some())
            .finish()
    }
}

/// Identifies a connection made with [`Dispatcher::connect`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct InterruptHandle {
    line: Line,
    id: u32,
}

impl InterruptHandle {
    /// The line this connection is attached to.
    #[must_use]
    pub fn line(&self) -> Line {
        self.line
    }
}

/// An error that could occur while dispatching an interrupt.
#[derive(Debug, Snafu)]
pub enum Error {
    /// A line fired that nothing is connected to.
    #[snafu(display("Unhandled interrupt on line {line}"))]
    UnhandledInterrupt {
        /// The line that fired.
        line: Line,
    },
    /// A connection needs at least one routine.
    EmptyConnection,
    /// The handle does not refer to a live connection.
    UnknownHandle,
}

type Table = HashMap<Line, Vec<(u32, Arc<Connection>)>>;

/// Routes interrupts from one [`InterruptSource`] to the routines connected to each line.
///
/// The connection table is replaced wholesale on every change, so the interrupt path reads it
/// without taking a lock.
pub struct Dispatcher {
    connections: ArcSwap<Table>,
    deferred: SegQueue<Arc<Connection>>,
    next_id: AtomicU32,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Create a dispatcher with nothing connected.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: ArcSwap::from_pointee(Table::new()),
            deferred: SegQueue::new(),
            next_id: AtomicU32::new(1),
        }
    }

    /// Connect routines to `line`. Several connections may share a line.
    ///
    /// # Errors
    /// Returns [`Error::EmptyConnection`] if neither routine is supplied.
    pub fn connect(&self, line: Line, connection: Connection) -> Result<InterruptHandle, Error> {
        snafu::ensure!(
            connection.service.is_some() || connection.worker.is_some(),
            EmptyConnectionSnafu
        );
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = Arc::new(connection);
        self.connections.rcu(|table| {
            let mut table = Table::clone(table);
            table
                .entry(line)
                .or_default()
                .push((id, connection.clone()));
            table
        });
        debug!("connected interrupt line {line} as #{id}");
        Ok(InterruptHandle { line, id })
    }

    /// Remove a connection.
    ///
    /// # Errors
    /// Returns [`Error::UnknownHandle`] if the connection was already removed.
    pub fn disconnect(&self, handle: InterruptHandle) -> Result<(), Error> {
        let mut found = false;
        self.connections.rcu(|table| {
            let mut table = Table::clone(table);
            found = false;
            if let Some(list) = table.get_mut(&handle.line) {
                let before = list.len();
                list.retain(|(id, _)| *id != handle.id);
                found = list.len() != before;
                if list.is_empty() {
                    table.remove(&handle.line);
                }
            }
            table
        });
        snafu::ensure!(found, UnknownHandleSnafu);
        debug!("disconnected interrupt line {} #{}", handle.line, handle.id);
        Ok(())
    }

    /// Whether anything is connected to `line`.
    #[must_use]
    pub fn is_connected(&self, line: Line) -> bool {
        self.connections.load().contains_key(&line)
    }

    /// Handle one interrupt from `source`.
    ///
    /// Every fast routine on the firing line runs; claiming connections with a worker have it
    /// queued. End-of-interrupt is issued exactly once per line that [`InterruptSource::begin`]
    /// reported, including when nothing is connected.
    ///
    /// # Errors
    /// - [`Error::UnhandledInterrupt`]: the line that fired has no connections.
    pub fn dispatch<S: InterruptSource + ?Sized>(
        &self,
        source: &S,
    ) -> Result<InterruptStatus, Error> {
        let (line, token) = match source.begin() {
            InterruptCause::NoInterruptHere => return Ok(InterruptStatus::NotClaimed),
            InterruptCause::Spurious => {
                trace!("spurious interrupt");
                return Ok(InterruptStatus::NotClaimed);
            }
            InterruptCause::LineFired { line, token } => (line, token),
        };
        trace!("handling interrupt {line}");

        let table = self.connections.load();
        let result = match table.get(&line) {
            Some(list) => Ok(list.iter().fold(InterruptStatus::NotClaimed, |status, (_, c)| {
                match self.service(c) {
                    InterruptStatus::Claimed => InterruptStatus::Claimed,
                    InterruptStatus::NotClaimed => status,
                }
            })),
            None => UnhandledInterruptSnafu { line }.fail(),
        };

        trace!("finished interrupt {line}");
        source.end_of_interrupt(token);
        result
    }

    fn service(&self, connection: &Arc<Connection>) -> InterruptStatus {
        let status = match &connection.service {
            Some(service) => service(),
            // worker-only connections always defer
            None => InterruptStatus::Claimed,
        };
        if status == InterruptStatus::Claimed && connection.worker.is_some() {
            self.deferred.push(connection.clone());
        }
        status
    }

    /// Run every queued deferred worker. Must be called at low run level.
    ///
    /// Returns the number of workers that ran.
    pub fn run_deferred(&self) -> usize {
        let mut count = 0;
        while let Some(connection) = self.deferred.pop() {
            if let Some(worker) = &connection.worker {
                worker();
                count += 1;
            }
        }
        count
    }

    /// Whether any deferred work is waiting.
    #[must_use]
    pub fn has_deferred_work(&self) -> bool {
        !self.deferred.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use mockall::predicate::eq;

    use super::{Connection, Dispatcher, Error};
    use crate::interrupt::{InterruptCause, InterruptStatus, MockInterruptSource};

    fn counting(
        counter: &Arc<AtomicUsize>,
        status: InterruptStatus,
    ) -> super::ServiceRoutine {
        let counter = counter.clone();
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            status
        })
    }

    #[test]
    fn unknown_interrupt_still_ends() {
        let mut source = MockInterruptSource::new();
        source
            .expect_begin()
            .once()
            .return_const(InterruptCause::LineFired { line: 7, token: 99 });
        source
            .expect_end_of_interrupt()
            .once()
            .with(eq(99))
            .return_const(());
        let d = Dispatcher::new();
        let res = d.dispatch(&source);
        assert!(matches!(res, Err(Error::UnhandledInterrupt { line: 7 })));
    }

    #[test]
    fn nothing_pending_is_not_an_error() {
        let mut source = MockInterruptSource::new();
        source
            .expect_begin()
            .once()
            .return_const(InterruptCause::NoInterruptHere);
        source.expect_end_of_interrupt().never();
        let d = Dispatcher::new();
        assert_eq!(d.dispatch(&source).unwrap(), InterruptStatus::NotClaimed);
    }

    #[test]
    fn claimed_interrupt_defers_worker() {
        let isr_count = Arc::new(AtomicUsize::new(0));
        let worker_count = Arc::new(AtomicUsize::new(0));
        let d = Dispatcher::new();
        d.connect(
            3,
            Connection {
                service: Some(counting(&isr_count, InterruptStatus::Claimed)),
                worker: Some(counting(&worker_count, InterruptStatus::Claimed)),
            },
        )
        .unwrap();

        let mut source = MockInterruptSource::new();
        source
            .expect_begin()
            .once()
            .return_const(InterruptCause::LineFired { line: 3, token: 1 });
        source
            .expect_end_of_interrupt()
            .once()
            .with(eq(1))
            .return_const(());

        assert_eq!(d.dispatch(&source).unwrap(), InterruptStatus::Claimed);
        assert_eq!(isr_count.load(Ordering::SeqCst), 1);
        assert_eq!(worker_count.load(Ordering::SeqCst), 0);
        assert!(d.has_deferred_work());
        assert_eq!(d.run_deferred(), 1);
        assert_eq!(worker_count.load(Ordering::SeqCst), 1);
        assert!(!d.has_deferred_work());
    }

    #[test]
    fn unclaimed_interrupt_does_not_defer() {
        let isr_count = Arc::new(AtomicUsize::new(0));
        let worker_count = Arc::new(AtomicUsize::new(0));
        let d = Dispatcher::new();
        d.connect(
            3,
            Connection {
                service: Some(counting(&isr_count, InterruptStatus::NotClaimed)),
                worker: Some(counting(&worker_count, InterruptStatus::Claimed)),
            },
        )
        .unwrap();

        let mut source = MockInterruptSource::new();
        source
            .expect_begin()
            .once()
            .return_const(InterruptCause::LineFired { line: 3, token: 5 });
        source.expect_end_of_interrupt().once().return_const(());

        assert_eq!(d.dispatch(&source).unwrap(), InterruptStatus::NotClaimed);
        assert_eq!(d.run_deferred(), 0);
    }

    #[test]
    fn shared_line_runs_every_routine() {
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        let d = Dispatcher::new();
        d.connect(
            9,
            Connection {
                service: Some(counting(&a, InterruptStatus::NotClaimed)),
                worker: None,
            },
        )
        .unwrap();
        d.connect(
            9,
            Connection {
                service: Some(counting(&b, InterruptStatus::Claimed)),
                worker: None,
            },
        )
        .unwrap();

        let mut source = MockInterruptSource::new();
        source
            .expect_begin()
            .once()
            .return_const(InterruptCause::LineFired { line: 9, token: 0 });
        source.expect_end_of_interrupt().once().return_const(());

        assert_eq!(d.dispatch(&source).unwrap(), InterruptStatus::Claimed);
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn disconnect_removes_line() {
        let a = Arc::new(AtomicUsize::new(0));
        let d = Dispatcher::new();
        let h = d
            .connect(
                2,
                Connection {
                    service: Some(counting(&a, InterruptStatus::Claimed)),
                    worker: None,
                },
            )
            .unwrap();
        assert!(d.is_connected(2));
        d.disconnect(h).unwrap();
        assert!(!d.is_connected(2));
        assert!(matches!(d.disconnect(h), Err(Error::UnknownHandle)));
    }

    #[test]
    fn empty_connection_rejected() {
        let d = Dispatcher::new();
        assert!(matches!(
            d.connect(1, Connection::default()),
            Err(Error::EmptyConnection)
        ));
    }
}
