use std::io::BufRead;
use std::sync::Arc;

use vokey_live::settings::{load_settings, settings_path};
use vokey_live::{CpalHost, LiveSettings, LiveTransport, SessionController, Voice};

fn main() {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = match settings_path() {
        Ok(path) => load_settings(&path),
        Err(e) => {
            log::warn!("{}; using default settings", e);
            LiveSettings::default()
        }
    };

    let voice = match std::env::args().nth(1) {
        Some(arg) => match arg.parse::<Voice>() {
            Ok(voice) => voice,
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(2);
            }
        },
        None => settings.default_voice,
    };

    let transport = LiveTransport::from_env();
    if !transport.has_api_key() {
        log::warn!("No API key found; the session will fail to connect");
    }

    let mut controller =
        match SessionController::start(Arc::new(CpalHost::new()), Arc::new(transport), settings) {
            Ok(controller) => controller,
            Err(e) => {
                eprintln!("Failed to start session thread: {}", e);
                std::process::exit(1);
            }
        };

    let mut snapshots = controller.subscribe();
    let printer = tokio::runtime::Builder::new_current_thread().build();
    match printer {
        Ok(runtime) => {
            std::thread::spawn(move || {
                runtime.block_on(async move {
                    let mut last = snapshots.borrow().clone();
                    while snapshots.changed().await.is_ok() {
                        let current = snapshots.borrow_and_update().clone();
                        if current.status != last.status || current.error != last.error {
                            match &current.error {
                                Some(e) => println!("[{}] {}", current.status, e),
                                None => println!("[{}]", current.status),
                            }
                        } else if bar(current.input_volume) != bar(last.input_volume)
                            || bar(current.output_volume) != bar(last.output_volume)
                        {
                            println!(
                                "  mic {:<10} speaker {:<10}",
                                bar(current.input_volume),
                                bar(current.output_volume)
                            );
                        }
                        last = current;
                    }
                });
            });
        }
        Err(e) => log::warn!("Status printer unavailable: {}", e),
    }

    println!("Connecting with voice {}. Press Enter to hang up.", voice);
    controller.connect(voice);

    let mut line = String::new();
    let _ = std::io::stdin().lock().read_line(&mut line);

    controller.disconnect();
    controller.shutdown();
}

/// Ten-step level bar
fn bar(volume: f32) -> String {
    "#".repeat((volume.clamp(0.0, 1.0) * 10.0).round() as usize)
}
