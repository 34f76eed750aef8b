//! Deadline supervision for radio operations.
//!
//! Every blocking radio operation runs under a deadline. Expiry calls the
//! installed fatal handler exactly once; the process is expected to exit
//! and be restarted by its supervisor. [`Watchdog::guard`] additionally
//! cancels the supervised future so the caller sees [`Error::Watchdog`]
//! instead of hanging.
//!
//! ```ignore
//! let watchdog = Watchdog::new(|op, deadline| {
//!     tracing::error!("{op} exceeded {deadline:?}");
//!     std::process::exit(75);
//! });
//! let _cycle = watchdog.arm("cycle", Duration::from_secs(300));
//! let data = watchdog.guard("read", Duration::from_secs(10), host.read_characteristic(s, c)).await?;
//! ```

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::error::{Error, Result};

/// Deadline for establishing a connection.
pub const CONNECT_DEADLINE: Duration = Duration::from_secs(30);
/// Deadline for one characteristic read or write.
pub const GATT_DEADLINE: Duration = Duration::from_secs(10);
/// Lower bound of a history chunk deadline.
pub const MIN_CHUNK_DEADLINE: Duration = Duration::from_secs(30);

/// Deadline for a history chunk of `records` records: one second per record,
/// never less than [`MIN_CHUNK_DEADLINE`].
pub fn chunk_deadline(records: usize) -> Duration {
    Duration::from_secs(u64::try_from(records).unwrap_or(u64::MAX)).max(MIN_CHUNK_DEADLINE)
}

type FatalHandler = dyn Fn(&str, Duration) + Send + Sync;

struct Inner {
    fired: AtomicBool,
    handler: Box<FatalHandler>,
}

/// Fires a fatal handler when a supervised operation overruns.
///
/// Cheap to clone; clones share the fired state.
#[derive(Clone)]
pub struct Watchdog {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("fired", &self.has_fired())
            .finish_non_exhaustive()
    }
}

impl Default for Watchdog {
    /// A watchdog whose handler only logs.
    fn default() -> Self {
        Self::new(|operation, deadline| {
            error!("Watchdog expired: '{}' exceeded {:?}", operation, deadline);
        })
    }
}

impl Watchdog {
    pub fn new(handler: impl Fn(&str, Duration) + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                fired: AtomicBool::new(false),
                handler: Box::new(handler),
            }),
        }
    }

    /// Start supervising `operation`. The handler fires after `deadline`
    /// unless the returned guard is dropped or disarmed first.
    #[must_use = "dropping the guard disarms the watchdog immediately"]
    pub fn arm(&self, operation: impl Into<String>, deadline: Duration) -> WatchdogGuard {
        let operation = operation.into();
        let task = match Handle::try_current() {
            Ok(handle) => {
                let watchdog = self.clone();
                Some(handle.spawn(async move {
                    tokio::time::sleep(deadline).await;
                    watchdog.fire(&operation, deadline);
                }))
            }
            Err(_) => {
                warn!("No tokio runtime available; '{}' runs unsupervised", operation);
                None
            }
        };
        WatchdogGuard { task }
    }

    /// Run `fut` under `deadline`. On expiry the future is dropped, the
    /// handler fires and [`Error::Watchdog`] is returned.
    pub async fn guard<T, F>(&self, operation: &str, deadline: Duration, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(deadline, fut).await {
            Ok(result) => result,
            Err(_) => {
                self.fire(operation, deadline);
                Err(Error::Watchdog {
                    operation: operation.to_string(),
                    deadline,
                })
            }
        }
    }

    /// Invoke the fatal handler. Only the first call has any effect.
    pub fn fire(&self, operation: &str, deadline: Duration) {
        if self
            .inner
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            (self.inner.handler)(operation, deadline);
        }
    }

    pub fn has_fired(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }
}

/// Keeps a deadline armed until dropped.
#[derive(Debug)]
pub struct WatchdogGuard {
    task: Option<JoinHandle<()>>,
}

impl WatchdogGuard {
    pub fn disarm(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for WatchdogGuard {
    fn drop(&mut self) {
        self.abort();
    }
}
