//! Operator interrupts delivered to in-flight steps.

use std::future::pending;

use tokio::sync::watch;
use tracing::warn;

/// Receiving side of an interrupt flag. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Interrupt {
    flag: watch::Receiver<bool>,
}

/// Sending side of an interrupt flag.
#[derive(Debug)]
pub struct InterruptTrigger {
    flag: watch::Sender<bool>,
}

impl InterruptTrigger {
    /// Raises the flag. Raising it twice is harmless.
    pub fn trigger(&self) {
        self.flag.send_replace(true);
    }
}

impl Interrupt {
    /// Creates a connected trigger and flag.
    #[must_use]
    pub fn pair() -> (InterruptTrigger, Self) {
        let (tx, rx) = watch::channel(false);
        (InterruptTrigger { flag: tx }, Self { flag: rx })
    }

    /// A flag that is never raised.
    #[must_use]
    pub fn never() -> Self {
        Self::pair().1
    }

    /// A flag raised by Ctrl-C. Must be called inside a Tokio runtime.
    #[must_use]
    pub fn on_ctrl_c() -> Self {
        let (trigger, interrupt) = Self::pair();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cleaning up");
                trigger.trigger();
            }
        });
        interrupt
    }

    /// Whether the flag has been raised.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.flag.borrow()
    }

    /// Completes once the flag is raised; never completes if the trigger
    /// is dropped unraised.
    pub async fn triggered(&self) {
        let mut flag = self.flag.clone();
        loop {
            if *flag.borrow_and_update() {
                return;
            }
            if flag.changed().await.is_err() {
                pending::<()>().await;
            }
        }
    }
}
