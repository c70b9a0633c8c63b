use clap::{Parser, Subcommand};
use msgperf::scenario::{run_suite, DEFAULT_SCENARIOS};
use msgperf::{Client, Config, Metrics, Protocol, Server};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "msgperf")]
#[command(about = "Message throughput and loss measurement over TCP and UDP", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run in server mode (receives one session)
    Server {
        /// Port to listen on
        #[arg(short, long, default_value = "5001")]
        port: u16,

        /// Bind to specific address
        #[arg(short, long)]
        bind: Option<String>,

        /// Use UDP instead of TCP
        #[arg(short, long)]
        udp: bool,

        /// Seconds to wait for the UDP session to finish
        #[arg(long, default_value = "10")]
        deadline: u64,

        /// Output in JSON format
        #[arg(short = 'J', long)]
        json: bool,
    },

    /// Run in client mode (sends one session)
    Client {
        /// Server address to connect to
        #[arg(default_value = "127.0.0.1")]
        server: String,

        /// Port to connect to
        #[arg(short, long, default_value = "5001")]
        port: u16,

        /// Use UDP instead of TCP
        #[arg(short, long)]
        udp: bool,

        /// Message size in bytes
        #[arg(short = 'l', long, default_value = "1000")]
        length: usize,

        /// Number of messages to send
        #[arg(short = 'n', long, default_value = "1000")]
        count: u64,

        /// Milliseconds to wait for each acknowledgment (TCP)
        #[arg(long, default_value = "1000")]
        ack_timeout_ms: u64,

        /// Resends of one message before giving up (TCP)
        #[arg(long, default_value = "5")]
        max_retries: u32,

        /// Output in JSON format
        #[arg(short = 'J', long)]
        json: bool,
    },

    /// Run the benchmark suite over loopback
    Suite {
        /// Runs per scenario
        #[arg(short, long, default_value = "5")]
        runs: usize,

        /// Output in JSON format
        #[arg(short = 'J', long)]
        json: bool,
    },
}

fn report(metrics: &Metrics, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(metrics)?);
    } else {
        println!("{}", metrics);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let complete = match cli.command {
        Commands::Server {
            port,
            bind,
            udp,
            deadline,
            json,
        } => {
            let protocol = if udp { Protocol::Udp } else { Protocol::Tcp };

            let mut config = Config::server(port)
                .with_protocol(protocol)
                .with_udp_deadline(Duration::from_secs(deadline))
                .with_json(json);

            if let Some(bind_addr) = bind {
                config.bind_addr = Some(bind_addr.parse()?);
            }

            let server = Server::new(config);
            let metrics = server.run().await?;
            report(&metrics, json)?;
            metrics.is_complete()
        }

        Commands::Client {
            server,
            port,
            udp,
            length,
            count,
            ack_timeout_ms,
            max_retries,
            json,
        } => {
            let protocol = if udp { Protocol::Udp } else { Protocol::Tcp };

            let config = Config::client(server, port)
                .with_protocol(protocol)
                .with_message_size(length)
                .with_message_count(count)
                .with_ack_timeout(Duration::from_millis(ack_timeout_ms))
                .with_max_retries(max_retries)
                .with_json(json);

            let client = Client::new(config)?;
            let metrics = client.run().await?;
            report(&metrics, json)?;
            metrics.is_complete()
        }

        Commands::Suite { runs, json } => {
            let summaries = run_suite(&DEFAULT_SCENARIOS, runs, &Config::default()).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&summaries)?);
            } else {
                for summary in &summaries {
                    println!("{}\n", summary);
                }
            }
            summaries.iter().all(|s| s.failed_runs == 0)
        }
    };

    if !complete {
        std::process::exit(1);
    }

    Ok(())
}
