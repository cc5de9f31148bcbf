//! Cancellation input for suspension points
//!
//! An [`Interrupt`] plays the role a pending signal plays for a sleeping
//! process: every place where a session can be suspended (waiting for the
//! instance lock, waiting for data or for space) races the wait against the
//! interrupt and gives up with [`DeviceError::Interrupted`] when it fires.
//! Nothing is committed by an interrupted operation.
//!
//! ```
//! use memdev::interrupt::InterruptSource;
//!
//! let source = InterruptSource::new();
//! let interrupt = source.interrupt();
//! assert!(!interrupt.is_raised());
//! source.raise();
//! assert!(interrupt.is_raised());
//! ```

use std::future::Future;

use tokio::sync::watch;

use crate::error::{DeviceError, Result};

/// Owner side: raises and clears the interrupt
#[derive(Debug)]
pub struct InterruptSource {
    tx: watch::Sender<bool>,
}

impl InterruptSource {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// A new observer of this source
    #[must_use]
    pub fn interrupt(&self) -> Interrupt {
        Interrupt {
            rx: self.tx.subscribe(),
        }
    }

    /// Interrupt every current and future wait until `clear` is called
    pub fn raise(&self) {
        self.tx.send_replace(true);
    }

    pub fn clear(&self) {
        self.tx.send_replace(false);
    }
}

impl Default for InterruptSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side, attached to a session
#[derive(Debug, Clone)]
pub struct Interrupt {
    rx: watch::Receiver<bool>,
}

impl Interrupt {
    /// An interrupt that is never raised
    #[must_use]
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    #[must_use]
    pub fn is_raised(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the interrupt is raised
    ///
    /// Never resolves if the source is gone without having raised it.
    pub async fn raised(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|raised| *raised).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Run `fut` unless the interrupt fires first
    ///
    /// An interrupt that is already raised wins without polling `fut`.
    ///
    /// # Errors
    /// `Interrupted` if the interrupt fired before `fut` completed.
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output> {
        if self.is_raised() {
            return Err(DeviceError::Interrupted);
        }
        tokio::select! {
            biased;
            () = self.raised() => Err(DeviceError::Interrupted),
            out = fut => Ok(out),
        }
    }
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::never()
    }
}
