//! Peer client binary
//!
//! Registers with the rendezvous server and drives a small numbered menu.
//! Control-loop events are printed by a separate thread as they arrive.

use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::mpsc::Receiver;
use std::thread;

use peer_client::{Identity, LinkEvent, Peer, PeerConfig, PeerEvent, PeerLink};

const MENU: &str = "\
1) Print peers
2) Refresh peer list
3) Disconnect
4) Connect to a peer
5) Send a message
6) Send a file
7) Exit";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    let args: Vec<String> = std::env::args().collect();
    let config = PeerConfig::from_args(&args)?;

    let identity = Identity::load_or_create(
        &config.identity_path,
        config.name.as_deref().unwrap_or("peer"),
    )?;

    log::info!("Peer client starting...");
    log::info!("  Server:    {}", config.server_addr);
    log::info!("  Name:      {}", config.name.as_deref().unwrap_or(&identity.name));
    log::info!("  Identity:  {}", config.identity_path.display());
    log::info!("  Downloads: {}", config.download_dir.display());
    log::info!("  Offset:    +{}", config.port_offset);

    let (mut peer, events) = Peer::connect(&config, &identity)?;
    thread::Builder::new()
        .name("events".into())
        .spawn(move || print_events(events))?;

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    let mut link: Option<PeerLink> = None;

    loop {
        println!("{}", MENU);
        let Some(choice) = prompt(&mut lines, &format!("{}> ", peer.name()))? else {
            break;
        };

        match choice.as_str() {
            "1" => {
                let peers = peer.peers();
                if peers.is_empty() {
                    println!("No other peers registered");
                }
                for entry in peers {
                    println!("  {} ({})", entry.name, entry.addr());
                }
            }
            "2" => {
                if !peer.refresh_peer_list() {
                    println!("Refresh was not acknowledged");
                }
            }
            "3" => {
                link = None;
                peer.disconnect();
                println!("Disconnected");
            }
            "4" => {
                let Some(name) = prompt(&mut lines, "Peer name: ")? else {
                    break;
                };
                if !peer.connect_to_peer(&name) {
                    println!("Request was not acknowledged");
                }
            }
            "5" => {
                let Some(active) = active_link(&peer, &mut link) else {
                    println!("No peer link yet");
                    continue;
                };
                let Some(text) = prompt(&mut lines, "Message: ")? else {
                    break;
                };
                if let Err(e) = active.send_text(&text) {
                    println!("Send failed: {}", e);
                    link = None;
                }
            }
            "6" => {
                let Some(active) = active_link(&peer, &mut link) else {
                    println!("No peer link yet");
                    continue;
                };
                let Some(path) = prompt(&mut lines, "File path: ")? else {
                    break;
                };
                match active.send_file(Path::new(&path)) {
                    Ok(size) => println!("Sent {} bytes", size),
                    Err(e) => println!("Send failed: {}", e),
                }
            }
            "7" => break,
            "" => {}
            other => println!("Unknown option {:?}", other),
        }
    }

    drop(link);
    peer.disconnect();
    Ok(())
}

fn prompt(
    lines: &mut impl Iterator<Item = io::Result<String>>,
    text: &str,
) -> io::Result<Option<String>> {
    print!("{}", text);
    io::stdout().flush()?;
    lines.next().transpose().map(|line| line.map(|l| l.trim().to_string()))
}

/// The current link, picking up a newly punched one if there is one
fn active_link<'a>(peer: &Peer, link: &'a mut Option<PeerLink>) -> Option<&'a mut PeerLink> {
    if let Some(fresh) = peer.take_link() {
        *link = Some(fresh);
    }
    link.as_mut()
}

fn print_events(events: Receiver<PeerEvent>) {
    for event in events {
        match event {
            PeerEvent::RosterComplete(entries) => {
                println!("[roster] {} peer(s) available", entries.len());
            }
            PeerEvent::PeerNotFound => println!("[server] peer not found"),
            PeerEvent::PeerBusy(name) => println!("[server] {} is busy", name),
            PeerEvent::HolePunchPreparing(addr) => println!("[punch] preparing with {}", addr),
            PeerEvent::HolePunchSucceeded(addr) => println!("[punch] connected to {}", addr),
            PeerEvent::HolePunchFailed(addr) => println!("[punch] could not reach {}", addr),
            PeerEvent::HolePunchAborted(name) => println!("[punch] aborted, {} went away", name),
            PeerEvent::Link(LinkEvent::Text(text)) => println!("[peer] {}", text),
            PeerEvent::Link(LinkEvent::File { name, path, size }) => {
                println!("[peer] received {} ({} bytes) -> {}", name, size, path.display());
            }
            PeerEvent::Link(LinkEvent::TransferFailed(name)) => {
                println!("[peer] transfer of {} failed", name);
            }
            PeerEvent::Link(LinkEvent::Closed) => println!("[peer] link closed"),
            PeerEvent::Disconnected => println!("[server] control connection closed"),
        }
    }
}
