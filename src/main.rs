// An example runner for the `condition_vision` library. It grades a video that
// has already been extracted to a directory of numbered frame images and
// prints the report as JSON. Artifacts are written under `./grader-artifacts`.
//
// Usage: condition_vision <frames_dir> [item_type] [fps]

use condition_vision::collaborators::{FrameDirectoryIngress, LocalObjectStore, MemoryStaging};
use condition_vision::{GraderConfig, GradingPipeline, GradingRequest};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let Some(frames_dir) = args.next() else {
        eprintln!("usage: condition_vision <frames_dir> [item_type] [fps]");
        return ExitCode::from(2);
    };
    let item_tag = args.next().unwrap_or_else(|| "comic".to_string());
    let fps = args.next().and_then(|v| v.parse::<f64>().ok()).unwrap_or(30.0);

    let config_path = std::env::var_os("GRADER_CONFIG").map(PathBuf::from);
    let config = match GraderConfig::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let pipeline = GradingPipeline::new(
        config,
        Arc::new(FrameDirectoryIngress::new(fps)),
        Arc::new(MemoryStaging::new()),
        Arc::new(LocalObjectStore::new("grader-artifacts")),
    );
    let job_id = format!("local-{}", std::process::id());

    match pipeline.run(GradingRequest::new(frames_dir, job_id, &item_tag)).await {
        Ok(report) => match serde_json::to_string_pretty(&report) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("failed to serialize report: {e}");
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            eprintln!("grading failed: {e}");
            ExitCode::FAILURE
        }
    }
}
