//! A minimal line client, illustrative only: connects, registers, then
//! relays stdin lines to the wire and prints whatever comes back.
//!
//! Grounded on the teacher's `src/bin/cli.rs` (`Cli::from_args()` driving
//! a `client::connect` + one-shot request), generalized from a
//! single-request-per-invocation tool to a long-lived line session since
//! IRC has no request/response pairing to key a one-shot command on.
//! Uses `flavor = "current_thread"` for the same reason the teacher's CLI
//! does: no need for a multi-threaded runtime in an interactive tool.

use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use ircd::line_codec::LineReader;
use ircd::DEFAULT_PORT;

#[derive(Parser)]
#[command(name = "irc-client", version, about = "A minimal line client for ircd")]
struct Cli {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(long)]
    nickname: String,

    #[arg(long)]
    password: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ircd::Result<()> {
    tracing_subscriber::fmt::try_init().ok();

    let cli = Cli::parse();
    let stream = TcpStream::connect((cli.host.as_str(), cli.port)).await?;
    let (read_half, mut write_half) = stream.into_split();

    if let Some(password) = &cli.password {
        write_half.write_all(format!("PASS {password}\r\n").as_bytes()).await?;
    }
    write_half.write_all(format!("NICK {}\r\n", cli.nickname).as_bytes()).await?;
    write_half.write_all(format!("USER {} 0 * :{}\r\n", cli.nickname, cli.nickname).as_bytes()).await?;

    let reader_task = tokio::spawn(async move {
        let mut lines = LineReader::new(read_half, 10_000);
        loop {
            match lines.read_line().await {
                Ok(Some(line)) => println!("< {line}"),
                Ok(None) => {
                    println!("-- connection closed by server --");
                    break;
                }
                Err(err) => {
                    eprintln!("-- read error: {err} --");
                    break;
                }
            }
        }
    });

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = stdin.next_line().await? {
        if write_half.write_all(format!("{line}\r\n").as_bytes()).await.is_err() {
            break;
        }
        if line.eq_ignore_ascii_case("QUIT") || line.to_ascii_uppercase().starts_with("QUIT ") {
            break;
        }
    }

    let _ = reader_task.await;
    Ok(())
}
