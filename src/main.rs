#[macro_use]
extern crate log;

use std::io::{self, BufRead, Write};
use std::net::SocketAddr;
use std::process;
use std::time::Duration;

use clap::Parser;
use simplelog::{ColorChoice, CombinedLogger, Config, LevelFilter, TermLogger, TerminalMode};

use kadht::node::Source;
use kadht::transport::udp::UdpTransport;
use kadht::{Key, Node, NodeConfig, REQUEST_TIMEOUT};

#[derive(Parser)]
#[command(name = "kadht", version, about = "A Kademlia DHT node with content-addressed storage")]
struct Args {
    /// UDP address to listen on.
    #[arg(long, default_value = "0.0.0.0:6881")]
    listen: SocketAddr,

    /// Bootstrap peer address; may be given multiple times.
    #[arg(long = "peer")]
    peers: Vec<SocketAddr>,

    /// Derive the node ID from a seed string instead of generating a random one.
    #[arg(long)]
    seed: Option<String>,

    /// Log verbosity (off, error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    log_level: LevelFilter,
}

fn main() {
    let args = Args::parse();
    CombinedLogger::init(vec![TermLogger::new(
        args.log_level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )])
    .expect("logger already initialized");

    let id = match &args.seed {
        Some(seed) => Key::from_seed(seed),
        None => Key::random(),
    };
    let node = match Node::create(NodeConfig {
        id,
        addr: args.listen,
        peers: args.peers,
        transport: UdpTransport::factory(),
    }) {
        Ok(node) => node,
        Err(err) => {
            error!("failed to start node: {}", err);
            process::exit(1);
        }
    };
    println!("node {} listening on {}", node.id(), node.addr());

    repl(&node);

    if let Err(err) = node.shutdown(Duration::from_secs(5)) {
        warn!("shutdown incomplete: {}", err);
    }
}

fn repl(node: &Node) {
    let stdin = io::stdin();
    loop {
        print!("> ");
        let _ = io::stdout().flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let line = line.trim();
        let (command, rest) = match line.split_whitespace().next() {
            Some(command) => (command, line[command.len()..].trim()),
            None => continue,
        };

        match command {
            "put" => {
                if rest.is_empty() {
                    println!("usage: put <data>");
                    continue;
                }
                match node.put(rest.as_bytes()) {
                    Ok(key) => println!("{}", key),
                    Err(err) => println!("put failed: {}", err),
                }
            }
            "get" => {
                let key = match Key::from_hex(rest) {
                    Ok(key) => key,
                    Err(err) => {
                        println!("usage: get <sha1-hex> ({})", err);
                        continue;
                    }
                };
                match node.get(&key, Duration::from_millis(REQUEST_TIMEOUT)) {
                    Ok((value, source)) => {
                        match source {
                            Source::Local => println!("node: local ({})", node.id()),
                            Source::Peer(contact) => println!("node: {}", contact.id),
                        }
                        println!("{}", String::from_utf8_lossy(&value));
                    }
                    Err(err) => println!("get failed: {}", err),
                }
            }
            "id" => println!("{}", node.id()),
            "exit" | "quit" => break,
            _ => println!("commands: put <data> | get <sha1-hex> | id | exit"),
        }
    }
}
