// CLI entry point for the Parlor signal server.
//
// Starts a standalone server that lobby peers register with and relay link
// traffic through. See `server.rs` for the networking architecture and
// `registry.rs` for the routing state.
//
// Usage:
//   parlor-signal [OPTIONS]
//     --port <PORT>    Listen port (default: 9090)
//     --bind <ADDR>    Bind address (default: 127.0.0.1)
//
// Log verbosity follows `RUST_LOG` (default `info`).

use parlor_signal::server::{SignalConfig, start_signal_server};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = parse_args();

    let (_handle, addr) = match start_signal_server(config) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("Failed to start signal server: {e}");
            std::process::exit(1);
        }
    };

    println!("Signal server listening on {addr}");
    println!("Press Ctrl+C to stop.");

    // The process exits on SIGINT; client connections are torn down with it.
    loop {
        std::thread::park();
    }
}

/// Parse command-line arguments into a `SignalConfig`. Plain
/// `std::env::args()` matching.
fn parse_args() -> SignalConfig {
    let mut config = SignalConfig::default();
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--port" => {
                i += 1;
                config.port = args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                    eprintln!("--port requires a valid port number");
                    std::process::exit(1);
                });
            }
            "--bind" => {
                i += 1;
                config.bind_addr = args.get(i).cloned().unwrap_or_else(|| {
                    eprintln!("--bind requires an address");
                    std::process::exit(1);
                });
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    config
}

fn print_usage() {
    println!("Usage: parlor-signal [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --port <PORT>    Listen port (default: 9090)");
    println!("  --bind <ADDR>    Bind address (default: 127.0.0.1)");
    println!("  --help, -h       Show this help");
}
