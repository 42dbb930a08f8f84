// Generic driver for one bidirectional streaming exchange.
//
// Two tasks per stream:
// - a writer that owns the outbound half and drains a request queue
//   (initial request, permit refills, half-close),
// - a reader that owns the inbound half, hands every response to the
//   caller in arrival order, and runs the permit budget after each one.
//
// The first failure from either side is reported through `on_error` exactly
// once; the driver is then terminal. A fresh stream needs a fresh driver.
use anyhow::Result;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch};

use crate::error::{ConfigError, StreamError};
use crate::flow::{FlowControl, PermitBudget};

/// Outbound half of a duplex exchange.
pub trait RequestSink<Req>: Send + 'static {
    fn send(&mut self, request: Req) -> impl Future<Output = Result<()>> + Send;
    /// Finish the outbound direction; the peer sees end-of-stream.
    fn half_close(&mut self) -> Result<()>;
}

/// Inbound half of a duplex exchange. `Ok(None)` means the peer finished.
pub trait ResponseSource<Resp>: Send + 'static {
    fn next_response(&mut self) -> impl Future<Output = Result<Option<Resp>>> + Send;
}

pub type ResponseHandler<Resp> = Box<dyn FnMut(Resp) -> Result<(), StreamError> + Send>;
pub type ErrorHandler = Box<dyn FnOnce(StreamError) + Send>;

/// Callbacks for one stream. A response handler returning `Err` ends the
/// stream with that error.
pub struct StreamHandlers<Resp> {
    pub on_response: ResponseHandler<Resp>,
    pub on_error: ErrorHandler,
}

enum Outbound<Req> {
    Send(Req),
    HalfClose,
}

struct Shared {
    terminal: AtomicBool,
    on_error: Mutex<Option<ErrorHandler>>,
    stop_tx: watch::Sender<bool>,
}

impl Shared {
    fn fail(&self, err: StreamError) {
        if self.terminal.swap(true, Ordering::AcqRel) {
            tracing::trace!(error = %err, "ignoring error on terminated stream");
            return;
        }
        tracing::debug!(error = %err, "duplex stream failed");
        let handler = self.on_error.lock().take();
        if let Some(handler) = handler {
            handler(err);
        }
        self.stop_tx.send_replace(true);
    }

    fn stop(&self) -> bool {
        if self.terminal.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.on_error.lock().take();
        self.stop_tx.send_replace(true);
        true
    }
}

pub struct DuplexDriver<Req> {
    outbound: mpsc::UnboundedSender<Outbound<Req>>,
    shared: Arc<Shared>,
}

impl<Req: Send + 'static> DuplexDriver<Req> {
    /// Validate the permit settings, queue `initial`, and spawn the stream
    /// tasks. `refill` builds the request that grants `n` more permits.
    pub fn start<Resp, S, R, F>(
        sink: S,
        source: R,
        handlers: StreamHandlers<Resp>,
        initial: Req,
        refill: F,
        flow: FlowControl,
    ) -> Result<Self, ConfigError>
    where
        Resp: Send + 'static,
        S: RequestSink<Req>,
        R: ResponseSource<Resp>,
        F: Fn(u64) -> Req + Send + 'static,
    {
        let budget = flow.budget()?;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            terminal: AtomicBool::new(false),
            on_error: Mutex::new(Some(handlers.on_error)),
            stop_tx,
        });

        // Queued before either task runs so it is always the first request.
        let _ = outbound.send(Outbound::Send(initial));

        tokio::spawn(run_writer(sink, outbound_rx, Arc::clone(&shared)));
        tokio::spawn(run_reader(ReaderTask {
            source,
            on_response: handlers.on_response,
            budget,
            refill,
            outbound: outbound.clone(),
            stop_rx,
            shared: Arc::clone(&shared),
        }));
        tracing::debug!(
            initial_permits = flow.initial_permits,
            refill_amount = flow.refill_amount,
            refill_threshold = flow.refill_threshold,
            "duplex stream started"
        );

        Ok(Self { outbound, shared })
    }

    /// Half-close the outbound direction and cancel the inbound one. Errors
    /// observed afterwards are not reported. Idempotent.
    pub fn stop(&self) {
        if self.shared.stop() {
            tracing::debug!("duplex stream stopped");
            let _ = self.outbound.send(Outbound::HalfClose);
        }
    }

    /// True once the stream was stopped or has failed.
    pub fn is_terminal(&self) -> bool {
        self.shared.terminal.load(Ordering::Acquire)
    }
}

impl<Req> Drop for DuplexDriver<Req> {
    fn drop(&mut self) {
        if self.shared.stop() {
            let _ = self.outbound.send(Outbound::HalfClose);
        }
    }
}

async fn run_writer<Req, S>(
    mut sink: S,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound<Req>>,
    shared: Arc<Shared>,
) where
    S: RequestSink<Req>,
{
    while let Some(item) = outbound_rx.recv().await {
        match item {
            Outbound::Send(request) => {
                if let Err(err) = sink.send(request).await {
                    shared.fail(StreamError::transport(err.context("send stream request")));
                    break;
                }
            }
            Outbound::HalfClose => {
                if let Err(err) = sink.half_close() {
                    tracing::debug!(error = %err, "half-close failed");
                }
                break;
            }
        }
    }
}

struct ReaderTask<Req, Resp, R, F> {
    source: R,
    on_response: ResponseHandler<Resp>,
    budget: PermitBudget,
    refill: F,
    outbound: mpsc::UnboundedSender<Outbound<Req>>,
    stop_rx: watch::Receiver<bool>,
    shared: Arc<Shared>,
}

async fn run_reader<Req, Resp, R, F>(task: ReaderTask<Req, Resp, R, F>)
where
    R: ResponseSource<Resp>,
    F: Fn(u64) -> Req,
{
    let ReaderTask {
        mut source,
        mut on_response,
        mut budget,
        refill,
        outbound,
        mut stop_rx,
        shared,
    } = task;
    loop {
        if *stop_rx.borrow() {
            break;
        }
        let next = tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            next = source.next_response() => next,
        };
        match next {
            Ok(Some(response)) => {
                if let Err(err) = on_response(response) {
                    shared.fail(err);
                    break;
                }
                if let Some(amount) = budget.on_delivered() {
                    tracing::trace!(amount, outstanding = budget.outstanding(), "permit refill");
                    metrics::counter!("logline_client_permit_refills_total").increment(1);
                    if outbound.send(Outbound::Send(refill(amount))).is_err() {
                        break;
                    }
                }
            }
            Ok(None) => {
                shared.fail(StreamError::ClosedByServer);
                break;
            }
            Err(err) => {
                shared.fail(StreamError::transport(err));
                break;
            }
        }
    }
    let _ = outbound.send(Outbound::HalfClose);
}
