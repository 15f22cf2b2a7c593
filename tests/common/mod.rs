//! Helpers shared by the transport integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use ara_mq::queer::Consumer;
use ara_mq::{handler_fn, ConsumeOptions, Context, Handler, Message};

/// Upper bound for any condition a test waits on.
const WAIT_LIMIT: Duration = Duration::from_secs(5);

/// Poll `condition` until it holds, panicking after [`WAIT_LIMIT`].
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Run `consume` in the background.
pub fn spawn_consume<C>(client: &Arc<C>, ctx: &Context) -> JoinHandle<ara_mq::Result<()>>
where
    C: Consumer + ?Sized + 'static,
{
    let client = Arc::clone(client);
    let ctx = ctx.clone();
    tokio::spawn(async move { client.consume(&ctx, ConsumeOptions::default()).await })
}

/// Records every delivery a handler sees as `(body, attempt)`.
#[derive(Clone, Default)]
pub struct Seen {
    deliveries: Arc<Mutex<Vec<(String, u32)>>>,
}

impl Seen {
    pub fn record(&self, msg: &Message) {
        let body = String::from_utf8_lossy(&msg.body).into_owned();
        self.deliveries.lock().unwrap().push((body, msg.attempt));
    }

    pub fn all(&self) -> Vec<(String, u32)> {
        self.deliveries.lock().unwrap().clone()
    }

    pub fn bodies(&self) -> Vec<String> {
        self.all().into_iter().map(|(body, _)| body).collect()
    }

    pub fn len(&self) -> usize {
        self.deliveries.lock().unwrap().len()
    }

    pub fn count(&self, body: &str) -> usize {
        self.all().iter().filter(|(b, _)| b == body).count()
    }

    /// Handler that records and acks everything.
    pub fn acking_handler(&self) -> Handler {
        let seen = self.clone();
        handler_fn(move |_ctx, msg: Message| {
            let seen = seen.clone();
            async move {
                seen.record(&msg);
                msg.ack();
                Ok(())
            }
        })
    }

    /// Handler that nacks the first attempt of `body` and acks the rest.
    pub fn nack_once_handler(&self, body: &'static str) -> Handler {
        let seen = self.clone();
        handler_fn(move |_ctx, msg: Message| {
            let seen = seen.clone();
            async move {
                seen.record(&msg);
                if msg.body == body.as_bytes() && msg.attempt == 1 {
                    msg.nack();
                } else {
                    msg.ack();
                }
                Ok(())
            }
        })
    }
}

/// Flags flipped by a handler that sleeps before acking.
#[derive(Clone, Default)]
pub struct SlowHandler {
    pub started: Arc<AtomicBool>,
    pub finished: Arc<AtomicBool>,
}

impl SlowHandler {
    pub fn handler(&self, sleep: Duration) -> Handler {
        let flags = self.clone();
        handler_fn(move |_ctx, msg: Message| {
            let flags = flags.clone();
            async move {
                flags.started.store(true, Ordering::SeqCst);
                tokio::time::sleep(sleep).await;
                flags.finished.store(true, Ordering::SeqCst);
                msg.ack();
                Ok(())
            }
        })
    }

    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn has_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}
