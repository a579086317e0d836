//! Remote build command: run a build on a labflash server and tail its log

use anyhow::Result;
use std::io::{self, Write};

use crate::cli::args::BuildArgs;
use crate::models::RelayOutcome;
use crate::remote::RemoteClient;

pub async fn execute_remote_build_command(server: &str, args: &BuildArgs) -> Result<()> {
    let client = RemoteClient::new(server)?;
    let request = args.to_request();
    println!(
        "📡 Building {}/{} (env {}) on {}",
        request.device_id,
        request.firmware_id,
        request.env_name,
        client.base_url()
    );

    let mut stdout = io::stdout();
    let outcome = client
        .build_streamed(&request, |delta| {
            let _ = stdout.write_all(delta.as_bytes());
            let _ = stdout.flush();
        })
        .await?;

    if let RelayOutcome::Complete { malformed, .. } = &outcome {
        if *malformed > 0 {
            log::warn!("Skipped {} malformed stream record(s)", malformed);
        }
    }
    let result = outcome.into_build_result()?;

    if result.success {
        println!("✅ Build succeeded: {}", result.path.as_deref().unwrap_or("-"));
        if result.flashed == Some(true) {
            println!("⚡ Flashed");
        }
        if let Some(error) = result.flash_error {
            println!("⚠️  Flashing failed: {}", error);
        }
        Ok(())
    } else if result.timed_out() {
        Err(anyhow::anyhow!(
            "Build timed out on the server: {}",
            result.error.unwrap_or_default()
        ))
    } else {
        Err(anyhow::anyhow!(
            "Build failed: {}",
            result.error.unwrap_or_else(|| "no error reported".to_string())
        ))
    }
}
