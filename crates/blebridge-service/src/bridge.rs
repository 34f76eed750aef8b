//! The long-running acquisition loop and its fatal path.
//!
//! Fatal conditions (a watchdog expiry, a wedged radio) end the process with
//! [`EX_TEMPFAIL`] so the supervisor restarts it with a fresh Bluetooth
//! stack. Before exiting, the sinks get one bounded flush.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use blebridge_core::{Error, Scheduler, TelemetryDispatcher, Watchdog};

/// `EX_TEMPFAIL` from sysexits.h.
pub const EX_TEMPFAIL: i32 = 75;

/// Bound on the flush performed on the fatal path.
pub const FATAL_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// How the acquisition loop ended.
#[derive(Debug)]
pub enum Shutdown {
    /// Cancelled, e.g. by ctrl-c.
    Requested,
    /// A fatal error; the process should exit with [`EX_TEMPFAIL`].
    Fatal(Error),
}

/// A watchdog whose expiry cancels `fatal`.
///
/// The handler runs on a timer task and cannot flush by itself; it signals
/// the main task, which flushes and exits. If the main task is itself stuck,
/// a backstop thread exits the process once the flush bound has passed.
pub fn fatal_watchdog(fatal: CancellationToken) -> Watchdog {
    Watchdog::new(move |operation, deadline| {
        error!("Watchdog expired: '{}' exceeded {:?}; restarting", operation, deadline);
        fatal.cancel();
        std::thread::spawn(|| {
            std::thread::sleep(FATAL_FLUSH_TIMEOUT + Duration::from_secs(1));
            std::process::exit(EX_TEMPFAIL);
        });
    })
}

/// Run acquisition cycles until `shutdown` is cancelled or a fatal error
/// occurs, pausing `pause` between cycles.
pub async fn run(
    scheduler: &mut Scheduler,
    pause: Duration,
    shutdown: &CancellationToken,
    fatal: &CancellationToken,
) -> Shutdown {
    info!(
        "Bridge running with {} registered devices",
        scheduler.registry().len()
    );
    loop {
        let outcome = tokio::select! {
            r = scheduler.run_cycle() => r,
            () = shutdown.cancelled() => return Shutdown::Requested,
            () = fatal.cancelled() => return Shutdown::Fatal(watchdog_error()),
        };
        match outcome {
            Ok(_) => {}
            Err(e) if e.is_fatal() => return Shutdown::Fatal(e),
            Err(e) => {
                // A failed scan or registry write; the scheduler escalates
                // repeated scan failures itself.
                warn!("Cycle failed: {}", e);
            }
        }

        tokio::select! {
            () = tokio::time::sleep(pause) => {}
            () = shutdown.cancelled() => return Shutdown::Requested,
            () = fatal.cancelled() => return Shutdown::Fatal(watchdog_error()),
        }
    }
}

fn watchdog_error() -> Error {
    Error::Watchdog {
        operation: "cycle".to_string(),
        deadline: Duration::ZERO,
    }
}

/// Best-effort flush on the way out, bounded by [`FATAL_FLUSH_TIMEOUT`].
pub async fn flush_before_exit(dispatcher: &TelemetryDispatcher) {
    if tokio::time::timeout(FATAL_FLUSH_TIMEOUT, dispatcher.flush())
        .await
        .is_err()
    {
        warn!("Final flush did not finish within {:?}", FATAL_FLUSH_TIMEOUT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use blebridge_core::mock::{MockHost, RecordingSink};
    use blebridge_core::{Registry, SchedulerConfig, TelemetrySink};

    fn scheduler(host: Arc<MockHost>, sink: Arc<RecordingSink>) -> Scheduler {
        Scheduler::new(
            host,
            Registry::in_memory(),
            TelemetryDispatcher::new(vec![sink as Arc<dyn TelemetrySink>]),
            Watchdog::default(),
            SchedulerConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_loop() {
        let host = Arc::new(MockHost::new());
        let sink = Arc::new(RecordingSink::new("recorder"));
        let mut scheduler = scheduler(host.clone(), sink);
        let shutdown = CancellationToken::new();
        let fatal = CancellationToken::new();

        let stopper = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            stopper.cancel();
        });

        let outcome = run(&mut scheduler, Duration::from_secs(5), &shutdown, &fatal).await;
        assert!(matches!(outcome, Shutdown::Requested));
        // 5 s scan + 5 s pause per cycle.
        assert!(host.scan_count() >= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wedged_radio_is_fatal() {
        let host = Arc::new(MockHost::new());
        host.set_scan_elapsed(Some(Duration::from_millis(100)));
        let sink = Arc::new(RecordingSink::new("recorder"));
        let mut scheduler = scheduler(host, sink);

        let outcome = run(
            &mut scheduler,
            Duration::from_secs(5),
            &CancellationToken::new(),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(outcome, Shutdown::Fatal(Error::RadioWedged { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_adapter_is_fatal() {
        let host = Arc::new(MockHost::new());
        host.fail_scans(u32::MAX);
        let sink = Arc::new(RecordingSink::new("recorder"));
        let mut scheduler = scheduler(host.clone(), sink);

        let outcome = run(
            &mut scheduler,
            Duration::from_secs(5),
            &CancellationToken::new(),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(outcome, Shutdown::Fatal(Error::RadioWedged { .. })));
        assert_eq!(host.scan_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_token_ends_loop() {
        let host = Arc::new(MockHost::new());
        let sink = Arc::new(RecordingSink::new("recorder"));
        let mut scheduler = scheduler(host, sink);
        let fatal = CancellationToken::new();
        fatal.cancel();

        let outcome = run(
            &mut scheduler,
            Duration::from_secs(5),
            &CancellationToken::new(),
            &fatal,
        )
        .await;
        assert!(matches!(outcome, Shutdown::Fatal(Error::Watchdog { .. })));
    }

    #[tokio::test]
    async fn test_flush_before_exit() {
        let sink = Arc::new(RecordingSink::new("recorder"));
        let dispatcher = TelemetryDispatcher::new(vec![sink.clone() as Arc<dyn TelemetrySink>]);
        flush_before_exit(&dispatcher).await;
        assert_eq!(sink.flush_count(), 1);
    }
}
