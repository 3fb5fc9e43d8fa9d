//! Lockstep bot for manual soak tests against a running relay
//!
//! Connects, prints the welcome, then plays the lockstep game: send one
//! message, wait for the server's aggregated reply, repeat.

use clap::Parser;
use relay_protocol::{parse_frames, parse_welcome, Sender};
use relay_server::framed::{read_message, write_message};
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::time::sleep;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Lockstep test client for the relay server")]
struct Args {
    /// Relay address
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    #[clap(short, long, default_value = "15000")]
    port: u16,
    /// Payload sent every round
    #[clap(short = 'm', long, default_value = "0:0")]
    payload: String,
    /// Rounds to play, 0 plays until the server hangs up
    #[clap(short, long, default_value = "0")]
    rounds: u64,
    /// Lobby id or name to join before playing
    #[clap(short, long)]
    join: Option<String>,
    /// Extra delay between rounds in milliseconds
    #[clap(short, long, default_value = "0")]
    delay: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let addr = format!("{}:{}", args.host, args.port);

    let stream = TcpStream::connect(&addr).await?;
    stream.set_nodelay(true)?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let welcome = read_message(&mut reader)
        .await?
        .ok_or("server closed before welcome")?;
    let (client_id, seed) = parse_welcome(&welcome)?;
    println!("Connected to {} as client {} (seed {})", addr, client_id, seed);

    let mut first = args.join.as_ref().map(|lobby| format!("#join {}", lobby));
    let mut round = 0u64;
    while args.rounds == 0 || round < args.rounds {
        let outgoing = first.take().unwrap_or_else(|| args.payload.clone());
        write_message(&mut write_half, &outgoing).await?;

        let Some(reply) = read_message(&mut reader).await? else {
            println!("Server closed the connection after {} rounds", round);
            break;
        };

        for frame in parse_frames(&reply)? {
            match (frame.sender, frame.payload.as_str()) {
                (Sender::Wildcard, _) => println!("[{}] purge", round),
                (Sender::Client(0), controls) => println!("[{}] control {}", round, controls),
                (Sender::Client(id), "D") => println!("[{}] client {} left", round, id),
                (Sender::Client(id), payload) => println!("[{}] {} -> {}", round, id, payload),
            }
        }

        round += 1;
        if args.delay > 0 {
            sleep(Duration::from_millis(args.delay)).await;
        }
    }

    Ok(())
}
