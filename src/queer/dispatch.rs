//! Front end shared by the pull-style transports: drains the adapter's
//! delivery channel into the registered handler.

use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;

use crate::context::Context;
use crate::error::{MqError, Result};
use crate::infrastructure::backoff::BackoffConfig;
use crate::message::Message;
use crate::metrics::ConsumeMetrics;
use crate::shutdown::{InFlight, Lifecycle};
use crate::supervisor::{ReconnectSupervisor, Subscription};

use super::Handler;

/// Holds the registered handler.
#[derive(Default)]
pub(crate) struct HandlerSlot {
    handler: RwLock<Option<Handler>>,
}

impl HandlerSlot {
    pub(crate) fn set(&self, handler: Handler) {
        let mut slot = match self.handler.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(handler);
    }

    pub(crate) fn get(&self) -> Result<Handler> {
        let slot = match self.handler.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.clone().ok_or(MqError::HandlerNotRegistered)
    }
}

/// Call `handler` for every message arriving on `deliveries`.
///
/// Returns `Ok(())` when the channel closes, the client starts closing or
/// `ctx` is cancelled. A handler error nacks the message (if the handler left
/// it unresolved) and is returned.
pub(crate) async fn drive_handler(
    transport: &'static str,
    ctx: &Context,
    closing: &Context,
    mut deliveries: mpsc::Receiver<Message>,
    handler: Handler,
    in_flight: &Arc<InFlight>,
    auto_ack: bool,
) -> Result<()> {
    loop {
        let msg = tokio::select! {
            biased;
            _ = closing.cancelled() => return Ok(()),
            _ = ctx.cancelled() => return Ok(()),
            next = deliveries.recv() => match next {
                Some(msg) => msg,
                None => return Ok(()),
            },
        };

        ConsumeMetrics::record_delivered(transport);
        tracing::debug!(
            transport = transport,
            id = ?msg.id,
            topic = ?msg.topic,
            attempt = msg.attempt,
            "Dispatching message to handler"
        );

        let result = {
            let _guard = in_flight.enter();
            handler(msg.context().clone(), msg.clone()).await
        };

        match result {
            Ok(()) => {
                if auto_ack && !msg.is_resolved() {
                    msg.ack();
                }
            }
            Err(e) => {
                ConsumeMetrics::record_handler_error(transport);
                let nacked = msg.nack();
                tracing::error!(
                    transport = transport,
                    id = ?msg.id,
                    nacked = nacked,
                    error = %e,
                    "Handler failed, stopping consumption"
                );
                return Err(MqError::Handler(e));
            }
        }
    }
}

/// Run `subscription` under a reconnect supervisor and feed its deliveries to
/// `handler` until the client closes, `ctx` is cancelled or the handler fails.
pub(crate) async fn consume_with<S>(
    transport: &'static str,
    subscription: S,
    backoff: BackoffConfig,
    ctx: &Context,
    lifecycle: &Lifecycle,
    handler: Handler,
    auto_ack: bool,
) -> Result<()>
where
    S: Subscription + 'static,
{
    let _consumer = lifecycle.consumers().enter();

    let (tx, rx) = mpsc::channel(1);
    let session_ctx = ctx.child();
    let pump = {
        let supervisor = ReconnectSupervisor::new(transport, backoff);
        let session_ctx = session_ctx.clone();
        let closing = lifecycle.closing().clone();
        tokio::spawn(async move {
            supervisor
                .run(&subscription, &session_ctx, &closing, tx)
                .await
        })
    };

    let result = drive_handler(
        transport,
        ctx,
        lifecycle.closing(),
        rx,
        handler,
        lifecycle.in_flight(),
        auto_ack,
    )
    .await;

    // Release an adapter still waiting on a message the handler never received
    session_ctx.cancel();
    let supervised = pump
        .await
        .map_err(|e| MqError::transport(format!("{transport} consumer task failed: {e}")))?;

    result.and(supervised)
}
