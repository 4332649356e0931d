//! The orchestrating client: converts decoded records, republishes control
//! events, and reconnects on unexpected stream termination.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::config::ClientConfig;
use crate::error::Result;
use crate::fifo::FifoReceiver;
use crate::position::LogPos;
use crate::record::{ChangeRecord, Event};
use crate::stream::{Stream, StreamOutput};
use crate::values::{self, EnumSet, ExtractContext};

/// Converts decoded change records into application-specific values.
///
/// Supplied by the embedding application; the extract context gives it
/// access to typed value extraction and the known-enum set.
pub trait Converter: Send + Sync + 'static {
    type Item: Send + 'static;

    fn convert(&self, record: &ChangeRecord, ctx: &ExtractContext) -> Self::Item;
}

impl<F, T> Converter for F
where
    F: Fn(&ChangeRecord, &ExtractContext) -> T + Send + Sync + 'static,
    T: Send + 'static,
{
    type Item = T;

    fn convert(&self, record: &ChangeRecord, ctx: &ExtractContext) -> T {
        self(record, ctx)
    }
}

/// Policy consulted after every unexpected stream termination.
///
/// `next_delay` returns how long to wait before the next attempt, or
/// `None` to give up (which shuts the client's feeds down). `reset` is
/// called whenever a replacement stream starts successfully.
pub trait ReconnectPolicy: Send + 'static {
    fn next_delay(&mut self) -> Option<Duration>;

    fn reset(&mut self) {}
}

/// The default policy: retry immediately, forever.
///
/// Under a persistently failing backend this is a tight retry loop;
/// callers wanting backoff supply their own policy or layer on the
/// `Reconnected`/`BackendExitFault` events.
pub struct RetryImmediately;

impl ReconnectPolicy for RetryImmediately {
    fn next_delay(&mut self) -> Option<Duration> {
        Some(Duration::ZERO)
    }
}

/// Policy that never reconnects: the first termination ends the client.
pub struct NoRetry;

impl ReconnectPolicy for NoRetry {
    fn next_delay(&mut self) -> Option<Duration> {
        None
    }
}

/// Feed of converted updates, one item per accepted change.
pub type Updates<T> = mpsc::UnboundedReceiver<T>;
/// Feed of control and diagnostic events.
pub type Events = mpsc::UnboundedReceiver<Event>;

/// Handle over one live replication stream with automatic reconnect.
///
/// Dropping the client without calling [`Client::close`] tears the
/// pipeline down without waiting for the backend to exit.
pub struct Client {
    stop: watch::Sender<bool>,
    closed: oneshot::Receiver<()>,
    position: Arc<AtomicU64>,
}

impl Client {
    /// Scans the catalog, starts the first stream and the receive loops.
    ///
    /// Setup faults (catalog scan, process spawn, pipe attach) are
    /// returned synchronously and nothing keeps running. On success the
    /// update and event feeds are live until [`Client::close`] or until
    /// the reconnect policy gives up.
    pub async fn connect<C: Converter>(
        config: ClientConfig,
        catalog: Arc<dyn Catalog>,
        converter: C,
        start_pos: LogPos,
    ) -> Result<(Client, Updates<C::Item>, Events)> {
        Self::connect_with_policy(config, catalog, converter, start_pos, RetryImmediately).await
    }

    /// Like [`Client::connect`] with an explicit reconnect policy.
    pub async fn connect_with_policy<C: Converter, P: ReconnectPolicy>(
        config: ClientConfig,
        catalog: Arc<dyn Catalog>,
        converter: C,
        start_pos: LogPos,
        policy: P,
    ) -> Result<(Client, Updates<C::Item>, Events)> {
        let enums: EnumSet = catalog.enum_oids().await?.into();
        info!(enums = enums.len(), slot = %config.slot, "client connecting");
        let ctx = ExtractContext::new(enums);

        let mut stream = Stream::new(&config.database, &config.program, &config.slot, start_pos);
        let output = stream.start()?;

        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (closed_tx, closed_rx) = oneshot::channel();

        let position = Arc::new(AtomicU64::new(start_pos.raw()));
        let supervisor = Supervisor {
            config,
            catalog,
            converter: Arc::new(converter),
            ctx,
            policy,
            updates: updates_tx,
            events: events_tx,
            stop: stop_rx,
            position: position.clone(),
        };
        tokio::spawn(supervisor.run(stream, output, closed_tx));

        Ok((
            Client {
                stop: stop_tx,
                closed: closed_rx,
                position,
            },
            updates_rx,
            events_rx,
        ))
    }

    /// Stops the client gracefully: interrupts the backend and blocks
    /// until it has exited and the receive loops are done. No update or
    /// event is published after this returns.
    pub async fn close(self) {
        let _ = self.stop.send(true);
        let _ = self.closed.await;
    }

    /// The position of the last change accepted for delivery, as a
    /// starting point for a future client.
    pub fn position(&self) -> LogPos {
        LogPos::new(self.position.load(Ordering::Acquire))
    }
}

struct Supervisor<C: Converter, P: ReconnectPolicy> {
    config: ClientConfig,
    catalog: Arc<dyn Catalog>,
    converter: Arc<C>,
    ctx: ExtractContext,
    policy: P,
    updates: mpsc::UnboundedSender<C::Item>,
    events: mpsc::UnboundedSender<Event>,
    stop: watch::Receiver<bool>,
    position: Arc<AtomicU64>,
}

enum Exit {
    StopRequested,
    Finished(Option<crate::error::Error>),
}

impl<C: Converter, P: ReconnectPolicy> Supervisor<C, P> {
    /// Control loop: owns the live stream, runs its data/stderr loops,
    /// and drives the reconnect state machine.
    async fn run(mut self, mut stream: Stream, mut output: StreamOutput, closed: oneshot::Sender<()>) {
        loop {
            let data_task = tokio::spawn(data_loop(
                output.records,
                self.catalog.clone(),
                self.converter.clone(),
                self.ctx.clone(),
                self.config.backfill,
                self.config.key_column.clone(),
                self.updates.clone(),
                self.events.clone(),
                self.position.clone(),
                self.stop.clone(),
            ));
            let stderr_task = tokio::spawn(stderr_loop(
                output.stderr_lines,
                self.events.clone(),
                self.stop.clone(),
            ));

            let mut finished = output.finished;
            let exit = tokio::select! {
                fault = &mut finished => Exit::Finished(fault.ok().flatten()),
                // Explicit stop, or the client handle disappeared.
                _ = self.stop.wait_for(|stopped| *stopped) => Exit::StopRequested,
            };

            let fault = match exit {
                Exit::StopRequested => {
                    if let Err(e) = stream.stop() {
                        warn!("failed to interrupt backend: {e}");
                    }
                    // Cooperative shutdown: no timeout, wait for the
                    // backend to actually exit.
                    finished.await.ok().flatten()
                }
                Exit::Finished(fault) => fault,
            };

            // The stream's FIFOs and record channel are closed by now, so
            // both loops run to completion before anything else happens.
            let _ = futures::future::join(data_task, stderr_task).await;

            let stopped = *self.stop.borrow() || self.stop.has_changed().is_err();
            if let Some(err) = fault {
                if stopped {
                    // An interrupted backend usually dies of the signal;
                    // that is the requested outcome, not a fault to publish.
                    debug!(%err, "backend fault during requested stop");
                } else {
                    let _ = self.events.send(Event::BackendExitFault(err));
                }
            }

            if stopped {
                debug!("client stopped");
                let _ = closed.send(());
                return;
            }

            match self.policy.next_delay() {
                Some(delay) => {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let _ = self.events.send(Event::Reconnected);
                    // The old stream is fully discarded before the new
                    // one starts, from the last accepted position.
                    let start = LogPos::new(self.position.load(Ordering::Acquire));
                    info!(start_pos = %start, "reconnecting");
                    stream =
                        Stream::new(&self.config.database, &self.config.program, &self.config.slot, start);
                    match stream.start() {
                        Ok(next) => {
                            self.policy.reset();
                            output = next;
                        }
                        Err(e) => {
                            // A failed restart counts as another
                            // unexpected termination; the policy is
                            // consulted again on the next turn.
                            warn!("reconnect failed: {e}");
                            let _ = self.events.send(Event::BackendExitFault(e));
                            output = StreamOutput::closed();
                        }
                    }
                }
                None => {
                    debug!("reconnect policy gave up");
                    let _ = closed.send(());
                    return;
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn data_loop<C: Converter>(
    mut records: mpsc::UnboundedReceiver<ChangeRecord>,
    catalog: Arc<dyn Catalog>,
    converter: Arc<C>,
    ctx: ExtractContext,
    backfill: bool,
    key_column: String,
    updates: mpsc::UnboundedSender<C::Item>,
    events: mpsc::UnboundedSender<Event>,
    position: Arc<AtomicU64>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let mut record = tokio::select! {
            record = records.recv() => match record {
                Some(record) => record,
                None => return,
            },
            _ = stop.wait_for(|stopped| *stopped) => return,
        };

        if backfill {
            let table = record.table.clone();
            for tuple in [&mut record.new_tuple, &mut record.old_tuple] {
                if let Err(error) =
                    values::backfill_unchanged(catalog.as_ref(), &key_column, &table, tuple).await
                {
                    // Scoped to this record: the datum stays absent and
                    // delivery continues.
                    let _ = events.send(Event::BackfillFault {
                        table: table.clone(),
                        error,
                    });
                }
            }
        }

        let item = converter.convert(&record, &ctx);
        if updates.send(item).is_err() {
            return;
        }
        position.store(record.position.raw(), Ordering::Release);
    }
}

async fn stderr_loop(
    mut lines: FifoReceiver<String>,
    events: mpsc::UnboundedSender<Event>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            line = lines.recv() => match line {
                Some(line) => {
                    if events.send(Event::StderrLine(line)).is_err() {
                        return;
                    }
                }
                None => return,
            },
            _ = stop.wait_for(|stopped| *stopped) => return,
        }
    }
}
