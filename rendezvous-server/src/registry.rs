//! Client registry for the rendezvous server
//!
//! Maps each registered peer name to its control connection and the address
//! the server observed for it. Names are a global mutual-exclusion key: the
//! check and the insert happen under one lock, so two connections can never
//! hold the same name at once.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use punch_core::message::NameError;
use punch_core::{validate_name, RosterEntry, SignalingConnection};

// ============================================================================
// Registration Types
// ============================================================================

/// A registered peer
#[derive(Debug, Clone)]
pub struct ClientRegistration {
    pub name: String,
    pub connection: Arc<SignalingConnection>,
    /// Address as observed by the server
    pub addr: SocketAddr,
}

/// Why a registration was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterError {
    /// Another live connection holds the name
    NameTaken(String),
    /// The name cannot be carried by the control vocabulary
    InvalidName(NameError),
}

impl fmt::Display for RegisterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterError::NameTaken(name) => write!(f, "name {:?} already registered", name),
            RegisterError::InvalidName(e) => write!(f, "invalid name: {}", e),
        }
    }
}

impl std::error::Error for RegisterError {}

// ============================================================================
// Registry Structure
// ============================================================================

/// Registry of live peers, shared by every connection handler
#[derive(Debug, Default)]
pub struct Registry {
    clients: Mutex<HashMap<String, ClientRegistration>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<String, ClientRegistration>> {
        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim `name` for `connection`
    ///
    /// The returned guard releases the name and closes the connection when
    /// dropped.
    pub fn register(
        self: &Arc<Self>,
        name: &str,
        connection: Arc<SignalingConnection>,
    ) -> Result<Registration, RegisterError> {
        validate_name(name).map_err(RegisterError::InvalidName)?;

        let registration = ClientRegistration {
            name: name.to_string(),
            addr: connection.peer_addr(),
            connection,
        };

        {
            let mut clients = self.clients();
            if clients.contains_key(name) {
                return Err(RegisterError::NameTaken(name.to_string()));
            }
            clients.insert(name.to_string(), registration.clone());
        }

        log::info!("Registered '{}' at {}", name, registration.addr);

        Ok(Registration {
            registry: Arc::clone(self),
            inner: registration,
        })
    }

    /// Remove `name` if it is still held by `connection`
    fn unregister(&self, name: &str, connection: &Arc<SignalingConnection>) -> bool {
        let mut clients = self.clients();
        match clients.get(name) {
            Some(existing) if Arc::ptr_eq(&existing.connection, connection) => {
                clients.remove(name);
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, name: &str) -> Option<ClientRegistration> {
        self.clients().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.clients().contains_key(name)
    }

    /// Every registered peer except `name`, ordered by name
    pub fn roster_except(&self, name: &str) -> Vec<RosterEntry> {
        let mut roster: Vec<RosterEntry> = self
            .clients()
            .values()
            .filter(|c| c.name != name)
            .map(|c| RosterEntry::new(c.name.clone(), c.addr))
            .collect();
        roster.sort_by(|a, b| a.name.cmp(&b.name));
        roster
    }

    pub fn len(&self) -> usize {
        self.clients().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients().is_empty()
    }

    /// Close every control connection; handlers then unwind on their own
    pub fn close_all(&self) {
        let connections: Vec<Arc<SignalingConnection>> = self
            .clients()
            .values()
            .map(|c| Arc::clone(&c.connection))
            .collect();
        for connection in connections {
            connection.close();
        }
    }
}

// ============================================================================
// Registration Guard
// ============================================================================

/// Live claim on a name
#[derive(Debug)]
pub struct Registration {
    registry: Arc<Registry>,
    inner: ClientRegistration,
}

impl Registration {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    pub fn connection(&self) -> &Arc<SignalingConnection> {
        &self.inner.connection
    }

    pub fn client(&self) -> &ClientRegistration {
        &self.inner
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.registry.unregister(&self.inner.name, &self.inner.connection) {
            log::info!("Unregistered '{}' ({})", self.inner.name, self.inner.addr);
        }
        self.inner.connection.close();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    /// Server-side connection plus the client socket keeping it open
    fn make_connection() -> (Arc<SignalingConnection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (Arc::new(SignalingConnection::new(server).unwrap()), client)
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = Arc::new(Registry::new());
        let (conn, client) = make_connection();

        let registration = registry.register("alice", conn).unwrap();

        let found = registry.lookup("alice").unwrap();
        assert_eq!(found.addr, client.local_addr().unwrap());
        assert_eq!(registration.addr(), found.addr);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let registry = Arc::new(Registry::new());
        let (first, _c1) = make_connection();
        let (second, _c2) = make_connection();

        let _held = registry.register("alice", first).unwrap();
        let err = registry.register("alice", Arc::clone(&second)).unwrap_err();

        assert_eq!(err, RegisterError::NameTaken("alice".into()));
        assert_eq!(registry.len(), 1);
        // The existing holder is untouched
        assert!(!Arc::ptr_eq(&registry.lookup("alice").unwrap().connection, &second));
    }

    #[test]
    fn test_invalid_name_rejected() {
        let registry = Arc::new(Registry::new());
        let (conn, _client) = make_connection();

        assert!(matches!(
            registry.register("a,b", conn),
            Err(RegisterError::InvalidName(NameError::ReservedCharacter))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_drop_releases_name() {
        let registry = Arc::new(Registry::new());
        let (first, _c1) = make_connection();
        let (second, _c2) = make_connection();

        let registration = registry.register("alice", first).unwrap();
        drop(registration);

        assert!(!registry.contains("alice"));
        assert!(registry.register("alice", second).is_ok());
    }

    #[test]
    fn test_roster_excludes_self() {
        let registry = Arc::new(Registry::new());
        let mut held = Vec::new();
        let mut clients = Vec::new();
        for name in ["carol", "alice", "bob"] {
            let (conn, client) = make_connection();
            held.push(registry.register(name, conn).unwrap());
            clients.push(client);
        }

        let names: Vec<String> = registry
            .roster_except("alice")
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["bob".to_string(), "carol".to_string()]);
    }

    #[test]
    fn test_concurrent_claims_single_winner() {
        let registry = Arc::new(Registry::new());
        let mut keep_open = Vec::new();
        let mut handles = Vec::new();

        for _ in 0..8 {
            let (conn, client) = make_connection();
            keep_open.push(client);
            let registry = Arc::clone(&registry);
            handles.push(std::thread::spawn(move || registry.register("same", conn).ok()));
        }

        let winners: Vec<Registration> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();

        assert_eq!(winners.len(), 1);
        assert_eq!(registry.len(), 1);
    }
}
