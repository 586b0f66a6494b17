// =============================================================================
// FRAME PACER - spinning quad on a paced Vulkan swapchain
// =============================================================================
//
// FRAME FLOW:
// 1. Wait for the frame slot's fence
// 2. Acquire swapchain image
// 3. Update the image's uniform buffer
// 4. Submit its pre-recorded commands
// 5. Present, rebuilding the swapchain when it goes stale
//
// =============================================================================

use std::fs::OpenOptions;
use std::io::Write;

use anyhow::Result;
use frame_pacer::app;
use frame_pacer::config::Config;

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting frame pacer");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!(
        "Present mode: {}, frames in flight: {}",
        config.graphics.present_mode,
        config.graphics.max_frames_in_flight
    );

    if let Err(e) = app::run(config) {
        log::error!("{:#}", e);
        return Err(e);
    }
    Ok(())
}

/// Initialize logging, optionally sending it to a file instead of stderr
fn init_logging(config: &Config) {
    use env_logger::{Builder, Target};
    use log::LevelFilter;

    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Info);
    // RUST_LOG overrides the default level
    builder.parse_default_env();

    if config.debug.log_to_file {
        match OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "=== Frame Pacer Log ===");
                let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
                let _ = writeln!(file);
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Cannot open log file {}: {}", config.debug.log_file, e),
        }
    }

    builder.init();
}
