//! Runs a small evaluation job against the offline echo backend.
//!
//! Prints progress snapshots and lifecycle events as they arrive. Pass a
//! JSON config path as the first argument to override the defaults:
//!
//! ```text
//! RUST_LOG=runway=debug cargo run -p runway --example echo_job -- runway.json
//! ```

use std::sync::Arc;

use runway::telemetry::init_tracing;
use runway::*;
use runway_testkit::RunConfigBuilder;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("runway=info");

    let config = match std::env::args().nth(1) {
        Some(path) => RunwayConfig::load(path)?,
        None => RunwayConfig::default(),
    };

    let events = Arc::new(RunEventBus::new(config.orchestrator.event_capacity));
    let mut event_rx = events.subscribe();
    let orchestrator = OrchestratorBuilder::new(config)
        .with_backend(EchoBackend::new())
        .with_events(events.clone())
        .build()?;

    let _progress = orchestrator.publisher().subscribe(|jobs| {
        for job in jobs {
            println!(
                "[PROGRESS] {} ({}): {} of {} | {} ok / {} failed",
                job.name,
                job.status.as_str(),
                job.current_run_index,
                job.total_runs,
                job.completed_runs,
                job.failed_runs,
            );
        }
    });

    let printer = tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            println!("[EVENT #{}] {:?}", event.meta.sequence, event.payload);
            if matches!(
                event.payload,
                RunEventPayload::JobFinished { .. } | RunEventPayload::JobCancelled
            ) {
                break;
            }
        }
    });

    let job = JobConfig::new("echo smoke test")
        .with_run(
            RunConfigBuilder::new("ocr-1")
                .kind(RunKind::Ocr)
                .attach("receipt.png")
                .prompt("Extract the merchant and total from the attached receipt.")
                .build(),
        )
        .with_run(
            RunConfigBuilder::new("prompt-1")
                .context("The quarterly report shows revenue growth of 12%.")
                .prompt("Summarise the context in one sentence.")
                .metric("rouge")
                .build(),
        )
        .with_run(
            RunConfigBuilder::new("chat-1")
                .kind(RunKind::Chat)
                .prompt("word ".repeat(200))
                .max_tokens(128)
                .build(),
        );

    let job_id = orchestrator.submit(job)?;
    let finished = orchestrator.join(job_id).await?;
    printer.await?;

    println!("\njob {} finished as {}", finished.id, finished.status());
    for outcome in orchestrator.export(job_id)? {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    }

    orchestrator.shutdown().await
}
