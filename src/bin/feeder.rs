/// DVR stream feeder: one channel's H.264 elementary stream to stdout.
///
/// Designed to be piped into ffmpeg for RTSP publishing, or run under the
/// bridge's ingest supervisor:
///
///   feeder --channel 0 | ffmpeg -fflags +genpts -r 25 -f h264 -i pipe:0 \
///       -c copy -f rtsp rtsp://127.0.0.1:8554/ch0
///
/// Exit codes: 0 clean shutdown, 1 auth/protocol failure, 2 network
/// failure, 64 usage error.
use clap::Parser;
use tokio::io::AsyncWriteExt;
use tracing::{error, info};

use hieasy_bridge::error::DvrError;
use hieasy_bridge::protocol::client::{Credentials, DvrClient};
use hieasy_bridge::protocol::StreamType;

const EXIT_AUTH_PROTOCOL: i32 = 1;
const EXIT_NETWORK: i32 = 2;
const EXIT_USAGE: i32 = 64;

#[derive(Parser, Debug)]
#[command(name = "feeder", about = "DVR H.264 stream feeder")]
struct Args {
    /// Camera channel (0-based)
    #[arg(short, long, default_value_t = 0)]
    channel: u8,

    /// Stream type: 0 = main (HD), 1 = sub (SD)
    #[arg(short = 's', long, default_value_t = 0)]
    stream_type: u8,

    /// DVR address (or set DVR_HOST)
    #[arg(long, env = "DVR_HOST")]
    host: Option<String>,

    #[arg(long, env = "DVR_CMD_PORT", default_value_t = 5050)]
    cmd_port: u16,

    #[arg(long, env = "DVR_MEDIA_PORT", default_value_t = 6050)]
    media_port: u16,

    #[arg(long, env = "DVR_USERNAME", default_value = "admin")]
    username: String,

    #[arg(long, env = "DVR_PASSWORD", default_value = "123456")]
    password: String,

    /// Debug logging (stderr)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            std::process::exit(EXIT_USAGE);
        }
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                let level = if args.verbose { "debug" } else { "info" };
                level.parse().unwrap_or_default()
            }),
        )
        .init();

    let Some(host) = args.host.clone() else {
        eprintln!("feeder: DVR host is required: use --host or set DVR_HOST");
        std::process::exit(EXIT_USAGE);
    };
    let stream_type = match args.stream_type {
        0 => StreamType::Main,
        1 => StreamType::Sub,
        _ => {
            eprintln!("feeder: --stream-type must be 0 or 1");
            std::process::exit(EXIT_USAGE);
        }
    };

    std::process::exit(run(args, host, stream_type).await);
}

async fn run(args: Args, host: String, stream_type: StreamType) -> i32 {
    let creds = Credentials {
        username: args.username.clone(),
        password: args.password.clone(),
    };

    let mut client = match DvrClient::connect(&host, args.cmd_port, creds).await {
        Ok(client) => client,
        Err(e) => return fail(e, "connect"),
    };
    let mut stream = match client
        .open_stream(args.channel, stream_type, args.media_port)
        .await
    {
        Ok(stream) => stream,
        Err(e) => {
            let code = fail(e, "open stream");
            client.close().await;
            return code;
        }
    };

    info!(channel = args.channel, "streaming to stdout");
    let mut stdout = tokio::io::stdout();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("SIGTERM handler");
    let code = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break 0;
            }
            _ = sigterm.recv() => {
                info!("terminated");
                break 0;
            }
            frame = stream.recv() => match frame {
                Some(frame) => {
                    if stdout.write_all(&frame).await.is_err() || stdout.flush().await.is_err() {
                        // Reader side of the pipe went away.
                        info!("stdout closed, stopping");
                        break 0;
                    }
                }
                None => {
                    if client.is_dead() {
                        error!("command channel died mid-stream");
                    } else {
                        error!("media stream ended");
                    }
                    break EXIT_NETWORK;
                }
            }
        }
    };

    drop(stream);
    client.close().await;
    code
}

fn fail(e: DvrError, phase: &str) -> i32 {
    error!("{phase} failed ({}): {e}", e.kind());
    if e.is_network() {
        EXIT_NETWORK
    } else {
        EXIT_AUTH_PROTOCOL
    }
}
