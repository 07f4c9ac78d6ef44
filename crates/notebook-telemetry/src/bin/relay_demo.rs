//! Runs a parent notebook that invokes a child notebook in-process, with both
//! executions sharing one trace.
//!
//! | Variable | Default | Meaning |
//! |---|---|---|
//! | `RUST_LOG` | `info` | Log filter. |
//! | `APPLICATIONINSIGHTS_CONNECTION_STRING` | unset | Reported at configure time. |
//! | `CHILD_TIMEOUT_SECS` | `60` | Timeout passed to the child run. |

use futures::FutureExt;
use notebook_telemetry::{
    LocalRunner, Parameters, RunError, Telemetry, TelemetryConfig, TelemetryInit,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

const CHILD_PATH: &str = "./sample-telemetry-notebook";

fn child_notebook(init: Arc<TelemetryInit>, parameters: Parameters) -> Result<String, RunError> {
    let telemetry = Telemetry::configure(TelemetryConfig::for_notebook(CHILD_PATH), &init)
        .map_err(|e| RunError::Failed {
            path: CHILD_PATH.to_string(),
            message: e.to_string(),
        })?;
    let outcome = telemetry.restore_context(&parameters);
    info!(?outcome, "child notebook started");

    let tracer = telemetry.tracer();
    let save_duration = telemetry.meter().create_histogram(
        "save_duration",
        "Duration in seconds of the save operation",
        "s",
    );

    let trips = tracer.in_span("process trips", |_| {
        tracer.in_span("write trips table", |span| {
            let table = parameters.get("table").map(String::as_str).unwrap_or("trips2");
            span.set_attribute("table", table);
            let t0 = Instant::now();
            info!("Saving data to table {}", table);
            save_duration.record(t0.elapsed().as_secs_f64());
        });
        tracer.in_span("count trips table", |span| {
            let trips_saved = 21_932i64;
            span.set_attribute("trips", trips_saved);
            info!("{} trips completed", trips_saved);
            trips_saved
        })
    });

    if let Err(e) = telemetry.shutdown() {
        error!("failed to flush child telemetry: {}", e);
    }
    Ok(trips.to_string())
}

#[tokio::main]
async fn main() {
    let init = Arc::new(TelemetryInit::new());
    let telemetry = match Telemetry::configure(TelemetryConfig::for_notebook("/demo/parent"), &init) {
        Ok(telemetry) => telemetry,
        Err(e) => {
            eprintln!("telemetry configuration failed: {e}");
            std::process::exit(2);
        }
    };

    let timeout = std::env::var("CHILD_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(60));

    let child_init = init.clone();
    let runner = LocalRunner::new().with_notebook(CHILD_PATH, move |parameters| {
        let init = child_init.clone();
        async move { child_notebook(init, parameters) }.boxed()
    });

    let mut arguments = Parameters::new();
    arguments.insert("table".to_string(), "trips2".to_string());

    let relay = telemetry.relay(Arc::new(runner));
    match relay
        .run_with_telemetry(CHILD_PATH, timeout, Some(arguments))
        .await
    {
        Ok(exit_value) => info!(exit_value = %exit_value, "child notebook finished"),
        Err(e) => error!("child notebook failed: {}", e),
    }

    if let Err(e) = telemetry.shutdown() {
        error!("failed to flush telemetry: {}", e);
    }
}
