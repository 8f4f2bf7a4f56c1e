// Terminal chat client for the relay.
//
// Reads lines from stdin and sends each one to the relay; prints whatever the
// relay forwards from other peers. A line consisting of `q` closes the
// connection and exits. When the relay closes the connection the client
// prints a notice and exits.
//
// Usage:
//   chat [--addr <HOST:PORT>]   (default: 127.0.0.1:8080)

use std::io::{self, BufRead, Write};
use std::net::Shutdown;
use std::thread;

use clap::Parser;
use tracing::{debug, error};

use chat_relay::client::{ChatClient, ClientEvent, is_quit_line};
use chat_relay::init_tracing;

#[derive(Parser, Debug)]
#[command(name = "chat", version, about = "Line-oriented client for the chat relay")]
struct Args {
    /// Relay address.
    #[arg(long, default_value = "127.0.0.1:8080")]
    addr: String,
}

fn main() {
    init_tracing();
    let args = Args::parse();

    let client = match ChatClient::connect(&args.addr) {
        Ok(client) => client,
        Err(e) => {
            error!(addr = %args.addr, error = %e, "connect failed");
            eprintln!("Failed to connect to {}: {e}", args.addr);
            std::process::exit(1);
        }
    };
    debug!(local_addr = %client.local_addr(), "connected");
    println!("Connected to chat relay at {}. Type `q` to quit.", args.addr);

    let (mut writer, inbox) = client.into_parts();

    // Printer thread: the relay closing the connection ends the process.
    thread::spawn(move || {
        for event in inbox {
            match event {
                ClientEvent::Data(bytes) => {
                    let mut stdout = io::stdout().lock();
                    let _ = write!(stdout, "[Message]: {}", String::from_utf8_lossy(&bytes));
                    let _ = stdout.flush();
                }
                ClientEvent::Closed => {
                    println!("Server closed connection.");
                    std::process::exit(0);
                }
            }
        }
    });

    for line in io::stdin().lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                debug!(error = %e, "stdin read failed");
                break;
            }
        };
        if is_quit_line(&line) {
            break;
        }
        if let Err(e) = writer.write_all(format!("{line}\n").as_bytes()) {
            eprintln!("Send failed: {e}");
            break;
        }
    }

    let _ = writer.shutdown(Shutdown::Both);
}
