use crate::{DgramAddr, Error};
use region::RequestRegion;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A published endpoint.
#[derive(Clone)]
pub enum Endpoint {
    /// A connected endpoint whose registered memory is a request region.
    Region(Arc<RequestRegion>),
    /// A datagram endpoint's address handle.
    Dgram(DgramAddr),
    /// A connected endpoint published for its name alone, so the opposite
    /// side can tell the connection handshake has happened.
    Peer,
}

/// The rendezvous directory: names to endpoints. Publication happens once
/// during setup; lookups may block, which is fine because rendezvous is
/// never on the data path.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Mutex<HashMap<String, Endpoint>>>,
    spin: bool,
}

impl Registry {
    /// The in-process directory.
    pub fn in_process() -> Self {
        Self {
            inner: Arc::default(),
            spin: false,
        }
    }

    /// Build the directory the environment asks for. `REGISTRY_IP` unset or
    /// `local` selects the in-process directory; pointing it anywhere else
    /// requires the deployment layer's directory service and is refused
    /// here. `CORRAL_SINGLE_THREADED=1` makes waiting lookups spin instead
    /// of yielding.
    pub fn from_env() -> Result<Self, Error> {
        let spin = std::env::var("CORRAL_SINGLE_THREADED").is_ok_and(|v| v == "1");
        match std::env::var("REGISTRY_IP") {
            Err(_) => Ok(Self {
                spin,
                ..Self::in_process()
            }),
            Ok(ip) if ip.is_empty() || ip == "local" => Ok(Self {
                spin,
                ..Self::in_process()
            }),
            Ok(ip) => Err(Error::RemoteRegistry(ip)),
        }
    }

    pub fn publish(&self, name: &str, endpoint: Endpoint) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.contains_key(name) {
            return Err(Error::NameTaken(name.to_string()));
        }
        tracing::debug!(name, "published endpoint");
        inner.insert(name.to_string(), endpoint);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<Endpoint> {
        self.inner.lock().unwrap().get(name).cloned()
    }

    /// Poll for a name until it appears or `timeout` elapses.
    pub fn lookup_wait(&self, name: &str, timeout: Duration) -> Result<Endpoint, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(endpoint) = self.lookup(name) {
                return Ok(endpoint);
            }
            if Instant::now() >= deadline {
                return Err(Error::LookupTimeout(name.to_string()));
            }
            if self.spin {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    pub fn lookup_region(&self, name: &str, timeout: Duration) -> Result<Arc<RequestRegion>, Error> {
        match self.lookup_wait(name, timeout)? {
            Endpoint::Region(region) => Ok(region),
            _ => Err(Error::WrongKind {
                name: name.to_string(),
                want: "region",
            }),
        }
    }

    pub fn lookup_dgram(&self, name: &str, timeout: Duration) -> Result<DgramAddr, Error> {
        match self.lookup_wait(name, timeout)? {
            Endpoint::Dgram(addr) => Ok(addr),
            _ => Err(Error::WrongKind {
                name: name.to_string(),
                want: "datagram",
            }),
        }
    }
}
