//! Veil command line: peer-to-peer encrypted chat over one TCP connection.
//!
//! One side listens, the other connects; the listener hands over the session
//! key and both drop into the chat loop. Operator lines come from a plain
//! stdin thread; everything the session wants shown arrives as a
//! [`SessionEvent`] and is printed here. The library never touches the
//! terminal.

#![forbid(unsafe_code)]

use std::io::Write as _;
use std::thread;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use veil_common::protocol::DEFAULT_PORT;
use veil_core::{run_dialer, run_listener, SessionEvent};

#[derive(Parser, Debug)]
#[command(name = "veil")]
#[command(about = "Peer-to-peer encrypted chat: no server, no tracking, no history")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Wait for a peer to connect
    Listen {
        /// TCP port to listen on
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Skip UPnP port forwarding
        #[arg(long, default_value_t = false)]
        no_upnp: bool,
    },

    /// Connect to a listening peer
    Connect {
        /// Peer IP address or host name
        host: String,

        /// Peer TCP port
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    veil_common::init_tracing();

    let args = Args::parse();

    println!("Veil - encrypted peer-to-peer chat");
    println!("No server. No tracking. No history.");
    println!("Type /quit to leave, /clear to clear the screen.\n");

    let (line_tx, line_rx) = mpsc::channel(32);
    let (event_tx, event_rx) = mpsc::channel(64);

    spawn_stdin_thread(line_tx);
    let printer = tokio::spawn(print_events(event_rx));

    let reason = match args.command {
        Command::Listen { port, no_upnp } => {
            run_listener(port, !no_upnp, line_rx, event_tx).await?
        }
        Command::Connect { host, port } => run_dialer(&host, port, line_rx, event_tx).await?,
    };

    let _ = printer.await;
    println!("[*] session ended: {reason}");
    Ok(())
}

/// Read operator lines on a plain thread and forward them to the session.
fn spawn_stdin_thread(tx: mpsc::Sender<String>) {
    thread::spawn(move || {
        let stdin = std::io::stdin();
        loop {
            prompt();

            let mut line = String::new();
            match stdin.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = line.trim_end_matches(['\r', '\n']).to_string();
                    if tx.blocking_send(line).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// Print session events to the terminal.
async fn print_events(mut events: mpsc::Receiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::MessageReceived { from, text } => {
                println!("\r[{}] {}", from.ip(), text);
                prompt();
            }
            SessionEvent::MessageSent { from, text } => {
                println!("\r[{}] {}", from.ip(), text);
                prompt();
            }
            SessionEvent::ClearScreen => {
                // ANSI clear + cursor home.
                print!("\x1b[2J\x1b[1;1H");
                prompt();
            }
            SessionEvent::MessageDropped { reason } => {
                println!("\r[!] {reason}");
                prompt();
            }
            SessionEvent::PeerDisconnected { peer } => {
                println!("\r[*] peer {peer} disconnected");
            }
            SessionEvent::PeerReset { peer } => {
                println!("\r[!] peer {peer} unexpectedly disconnected");
            }
            SessionEvent::Closed => {
                println!("\r[*] connection closed, session key wiped");
            }
        }
    }
}

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}
