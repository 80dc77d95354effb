use crate::channel::Channel;
use crate::config::RegistryConfig;
use crate::shared::{read, write, ConnId, ErrorKind, NetError, NetResult};
use hashbrown::HashMap;
use marline::logging::{self, Logger};
use marline::time::timestamp_secs;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

/// Endpoint-wide index of live channels keyed by connection id. Reader heavy:
/// the accept path inserts, the disconnect path removes, everything else
/// looks up. The reaper scans it for idle channels.
pub struct Registry {
    conns: RwLock<HashMap<ConnId, Arc<Channel>>>,
    conn_count: AtomicI64,
    un_active_seconds: i64,
    log: Logger,
}

impl Registry {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(config: &RegistryConfig, log: L) -> Registry {
        let registry_log = match log.into() {
            Some(parent) => parent.new(logging::o!("component" => "registry")),
            None => logging::discard(),
        };

        Registry {
            conns: RwLock::new(HashMap::new()),
            conn_count: AtomicI64::new(0),
            un_active_seconds: config.un_active_seconds,
            log: registry_log,
        }
    }

    /// Registers a channel. Rejects non-positive ids and duplicates.
    pub fn add(&self, conn: Arc<Channel>) -> NetResult<()> {
        let conn_id = conn.get_conn_id();
        if conn_id <= 0 {
            return Err(NetError::Fatal(ErrorKind::InvalidArgument));
        }

        let mut conns = write(&self.conns);
        if conns.contains_key(&conn_id) {
            return Err(NetError::Fatal(ErrorKind::AlreadyExists));
        }

        conns.insert(conn_id, conn);
        self.conn_count.fetch_add(1, Ordering::AcqRel);

        Ok(())
    }

    /// Forgets a channel. Removing an absent id is a no-op.
    pub fn remove(&self, conn_id: ConnId) {
        if write(&self.conns).remove(&conn_id).is_some() {
            self.conn_count.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub fn get(&self, conn_id: ConnId) -> NetResult<Arc<Channel>> {
        read(&self.conns)
            .get(&conn_id)
            .cloned()
            .ok_or(NetError::Fatal(ErrorKind::NotFound))
    }

    #[inline]
    pub fn len(&self) -> i64 {
        self.conn_count.load(Ordering::Acquire)
    }

    /// Drops every entry without touching the sockets; channels are closed by
    /// their owning buckets.
    pub fn clear(&self) {
        let mut conns = write(&self.conns);
        let dropped = conns.len();
        *conns = HashMap::new();
        self.conn_count.store(0, Ordering::Release);

        logging::debug!(self.log, "registry cleared"; "context" => "clear", "dropped" => dropped);
    }

    /// Channels whose last successful I/O is at least the idle cutoff ago.
    pub fn stale(&self) -> Vec<Arc<Channel>> {
        let now = timestamp_secs();

        read(&self.conns)
            .values()
            .filter(|conn| now - conn.get_active_time() >= self.un_active_seconds)
            .cloned()
            .collect()
    }
}
