//! Accept loop and housekeeping

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use punch_core::hole_punch::into_blocking;

use crate::config::ServerConfig;
use crate::handler::{handle_client, HandlerContext};
use crate::registry::Registry;
use crate::session::Coordinator;

/// mio token for the listening socket
const LISTENER_TOKEN: Token = Token(0);

/// How often the accept loop checks the shutdown flag
const TICK: Duration = Duration::from_millis(500);

/// How often stale sessions are swept
const JANITOR_INTERVAL: Duration = Duration::from_secs(1);

pub struct Server {
    poll: Poll,
    listener: TcpListener,
    local_addr: SocketAddr,
    ctx: HandlerContext,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    pub fn bind(config: ServerConfig) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(config.listen_addr)?;
        let local_addr = listener.local_addr()?;

        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let registry = Arc::new(Registry::new());
        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&registry),
            config.prepare_delay,
            config.ack,
        ));

        log::info!("Rendezvous server listening on {}", local_addr);

        Ok(Self {
            poll,
            listener,
            local_addr,
            ctx: HandlerContext {
                registry,
                coordinator,
                config: Arc::new(config),
            },
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Setting this flag stops [`Server::run`] within one tick
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.ctx.registry)
    }

    pub fn coordinator(&self) -> Arc<Coordinator> {
        Arc::clone(&self.ctx.coordinator)
    }

    pub fn run(&mut self) -> io::Result<()> {
        let janitor = self.spawn_janitor()?;
        let mut events = Events::with_capacity(128);

        let result = loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break Ok(());
            }

            if let Err(e) = self.poll.poll(&mut events, Some(TICK)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                break Err(e);
            }

            for event in events.iter() {
                if event.token() == LISTENER_TOKEN {
                    self.accept_pending();
                }
            }
        };

        log::info!("Rendezvous server shutting down");
        self.shutdown.store(true, Ordering::Relaxed);
        self.ctx.registry.close_all();
        if janitor.join().is_err() {
            log::warn!("Session janitor panicked");
        }

        result
    }

    fn accept_pending(&mut self) {
        loop {
            let (stream, from) = match self.listener.accept() {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("Accept failed: {}", e);
                    return;
                }
            };

            log::info!("New connection from {}", from);

            let stream = match into_blocking(stream) {
                Ok(stream) => stream,
                Err(e) => {
                    log::warn!("Cannot configure connection from {}: {}", from, e);
                    continue;
                }
            };

            let ctx = self.ctx.clone();
            let spawned = thread::Builder::new()
                .name(format!("client-{}", from))
                .spawn(move || handle_client(stream, ctx));
            if let Err(e) = spawned {
                log::error!("Cannot spawn handler for {}: {}", from, e);
            }
        }
    }

    fn spawn_janitor(&self) -> io::Result<thread::JoinHandle<()>> {
        let coordinator = Arc::clone(&self.ctx.coordinator);
        let shutdown = Arc::clone(&self.shutdown);
        let timeout = self.ctx.config.session_timeout;

        thread::Builder::new()
            .name("session-janitor".into())
            .spawn(move || {
                while !shutdown.load(Ordering::Relaxed) {
                    thread::sleep(JANITOR_INTERVAL);
                    let expired = coordinator.expire_stale(timeout);
                    if expired > 0 {
                        log::info!("Expired {} stale hole punch sessions", expired);
                    }
                }
            })
    }
}
