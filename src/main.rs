use anyhow::Result;
use ems_core::{config::Config, pipeline::EmsCore, telemetry};
use telemetry::init_tracing;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cfg = Config::load()?;
    info!(
        tick_ms = cfg.aggregation.tick_ms,
        tolerance_kw = cfg.aggregation.balance_tolerance_kw,
        "starting EMS state core"
    );

    let handle = EmsCore::start(cfg.clone());

    #[cfg(feature = "sim")]
    let sim_tracker = {
        let tracker = tokio_util::task::TaskTracker::new();
        let cancel = tokio_util::sync::CancellationToken::new();
        ems_core::sim::spawn_sources(
            &tracker,
            ems_core::sim::default_sources(),
            handle.ingestor(),
            cfg.aggregation.tick(),
            cancel.clone(),
        );
        tracker.close();
        info!("simulated subsystem sources running");
        (tracker, cancel)
    };

    // Surface every published snapshot and every fault on the log until the
    // process is told to stop.
    let mut snapshots = handle.subscribe();
    let mut faults = handle.faults();
    let observer = tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(status) = snapshots.next() => {
                    info!(
                        tick = status.tick,
                        health = %status.overall_health,
                        residual_kw = format!("{:.3}", status.power_balance_residual_kw),
                        "snapshot"
                    );
                }
                Ok(event) = faults.recv() => {
                    warn!(subsystem = %event.fault.subsystem(), fault = %event.fault, "fault reported");
                }
                else => break,
            }
        }
    });

    telemetry::shutdown_signal().await;

    #[cfg(feature = "sim")]
    {
        let (tracker, cancel) = sim_tracker;
        cancel.cancel();
        tracker.wait().await;
    }

    handle.shutdown().await;
    observer.abort();

    warn!("shutdown complete");
    Ok(())
}
