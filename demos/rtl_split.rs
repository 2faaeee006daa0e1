//! rtl_tcp splitter
//!
//! Run with: cargo run --example rtl_split -- [OPTIONS]
//!
//! Examples:
//!   cargo run --example rtl_split                          # localhost:1234 → 0.0.0.0:1234
//!   cargo run --example rtl_split -- -t 192.168.1.20 -l 1235
//!   cargo run --example rtl_split -- -t sdr.local -p 1234 -l 7373 --drain
//!
//! Then point any number of rtl_tcp clients (SDR++, gqrx, rtl_433 ...) at the
//! listen port. Tuning commands from every client reach the dongle; when two
//! clients disagree, the most recent command wins.

use std::time::Duration;

use rtl_split::{ReconnectPolicy, RelayConfig, RelayServer, SlowClientPolicy};

fn print_usage() {
    eprintln!("Usage: rtl_split [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -t, --target <HOST>     rtl_tcp server address (default: localhost)");
    eprintln!("  -p, --port <PORT>       rtl_tcp server port (default: 1234)");
    eprintln!("  -l, --listen <PORT>     Listening port (default: 1234)");
    eprintln!("  -q, --queue <BYTES>     Per-client queue limit (default: 16777216)");
    eprintln!("      --drain             Flush slow clients before closing them");
    eprintln!("  -r, --reconnect <N>     Reconnect to the server up to N times");
    eprintln!("  -h, --help              Show this help");
}

fn parse_args(args: &[String]) -> Result<RelayConfig, String> {
    let mut config = RelayConfig::default();
    let mut iter = args.iter().skip(1);

    while let Some(arg) = iter.next() {
        let mut value = |name: &str| {
            iter.next()
                .cloned()
                .ok_or_else(|| format!("{} requires a value", name))
        };

        match arg.as_str() {
            "-t" | "--target" => {
                let host = value(arg)?;
                config.upstream_host = host;
            }
            "-p" | "--port" => {
                let port = value(arg)?;
                config.upstream_port = port
                    .parse()
                    .map_err(|_| format!("Invalid port: {}", port))?;
            }
            "-l" | "--listen" => {
                let port = value(arg)?;
                let port = port
                    .parse()
                    .map_err(|_| format!("Invalid port: {}", port))?;
                config = config.listen_port(port);
            }
            "-q" | "--queue" => {
                let bytes = value(arg)?;
                let bytes = bytes
                    .parse()
                    .map_err(|_| format!("Invalid queue size: {}", bytes))?;
                config = config.max_queued_bytes(bytes);
            }
            "--drain" => {
                config = config.slow_client_policy(SlowClientPolicy::Drain);
            }
            "-r" | "--reconnect" => {
                let attempts = value(arg)?;
                let attempts = attempts
                    .parse()
                    .map_err(|_| format!("Invalid attempt count: {}", attempts))?;
                config = config.reconnect(
                    ReconnectPolicy::retry(attempts).initial_backoff(Duration::from_secs(1)),
                );
            }
            other => return Err(format!("Unknown argument: {}", other)),
        }
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let config = match parse_args(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rtl_split=info".parse()?),
        )
        .init();

    println!(
        "Relaying rtl_tcp {} on {}",
        config.upstream_addr(),
        config.listen_addr
    );

    let server = RelayServer::new(config);

    let result = server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;

    if let Err(e) = result {
        eprintln!("Relay stopped: {}", e);
        std::process::exit(1);
    }

    println!("Shut down");
    Ok(())
}
