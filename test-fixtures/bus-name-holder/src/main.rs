//! Bus name holder for bustest integration tests.
//!
//! Connects to the bus named by the standard environment variables, claims a
//! well-known name and holds it until SIGTERM.
//!
//! Usage: `bus-name-holder <name> [--delay-ms N] [--exit-after-ms N] [--exit-code N]`
//! - `--delay-ms`: wait before claiming the name
//! - `--exit-after-ms`: exit on its own after holding the name this long
//! - `--exit-code`: status used for that self-initiated exit

use std::time::Duration;

use tracing_subscriber::EnvFilter;

struct Options {
    name: String,
    delay: Duration,
    exit_after: Option<Duration>,
    exit_code: i32,
}

fn parse_args() -> Result<Options, String> {
    let mut args = std::env::args().skip(1);
    let mut name = None;
    let mut delay = Duration::ZERO;
    let mut exit_after = None;
    let mut exit_code = 0;

    while let Some(arg) = args.next() {
        let mut number = |flag: &str| -> Result<u64, String> {
            args.next()
                .ok_or_else(|| format!("{flag} needs a value"))?
                .parse()
                .map_err(|e| format!("{flag}: {e}"))
        };
        match arg.as_str() {
            "--delay-ms" => delay = Duration::from_millis(number("--delay-ms")?),
            "--exit-after-ms" => {
                exit_after = Some(Duration::from_millis(number("--exit-after-ms")?));
            }
            "--exit-code" => {
                exit_code = i32::try_from(number("--exit-code")?).map_err(|e| e.to_string())?;
            }
            other if other.starts_with("--") => return Err(format!("unknown option {other}")),
            other => name = Some(other.to_string()),
        }
    }

    Ok(Options {
        name: name.ok_or("missing bus name")?,
        delay,
        exit_after,
        exit_code,
    })
}

async fn run(options: Options) -> Result<i32, Box<dyn std::error::Error>> {
    tokio::time::sleep(options.delay).await;

    let builder = match std::env::var("DBUS_STARTER_BUS_TYPE").as_deref() {
        Ok("system") => zbus::connection::Builder::system()?,
        _ => zbus::connection::Builder::session()?,
    };
    let _connection = builder.name(options.name.as_str())?.build().await?;
    tracing::info!(name = %options.name, "bus name acquired");

    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let exit_after = async {
        match options.exit_after {
            Some(after) => tokio::time::sleep(after).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = terminate.recv() => {
            tracing::info!("terminated");
            Ok(0)
        }
        _ = exit_after => Ok(options.exit_code),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let options = match parse_args() {
        Ok(options) => options,
        Err(e) => {
            eprintln!("bus-name-holder: {e}");
            std::process::exit(2);
        }
    };

    match run(options).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!(error = %e, "bus-name-holder failed");
            std::process::exit(1);
        }
    }
}
