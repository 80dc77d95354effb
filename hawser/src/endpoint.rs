use crate::bucket::{Bucket, DisconnectCallback, ReadCallback, SendRequest};
use crate::channel::Channel;
use crate::config::{Config, TcpVersion};
use crate::dispatch::{Dispatcher, Request, Router};
use crate::frame::Codec;
use crate::group::Group;
use crate::registry::Registry;
use crate::shared::{lock, read, write, ConnId, ErrorKind, GroupId, NetError, NetResult};
use marline::logging::{self, Logger};
use marline::ticker::Ticker;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const LISTENER: Token = Token(0);
const ACCEPT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

const STATE_INIT: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPING: u8 = 2;
const STATE_STOPPED: u8 = 3;

/// Endpoint lifecycle. Transitions only move forward:
/// `Init → Running → Stopping → Stopped`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EndpointState {
    Init,
    Running,
    Stopping,
    Stopped,
}

pub type ConnectedHook = Arc<dyn Fn(Arc<Channel>) + Send + Sync>;
pub type DisconnectedHook = Arc<dyn Fn(Arc<Channel>) + Send + Sync>;
pub type ReadMessageHook = Arc<dyn Fn(Arc<Channel>, Request) -> NetResult<()> + Send + Sync>;
pub type GenConnIdHook = Arc<dyn Fn() -> ConnId + Send + Sync>;

/// The server: binds the listener, shards accepted connections into buckets,
/// wires decoded frames into the dispatcher and runs the idle reaper. All
/// state is endpoint-scoped, so several endpoints can share a process.
pub struct Endpoint {
    config: RwLock<Config>,
    state: AtomicU8,

    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
    buckets: RwLock<Vec<Arc<Bucket>>>,
    next_conn_id: Arc<AtomicI64>,
    local_addr: RwLock<Option<SocketAddr>>,

    // Hook cells are shared with the long-lived tasks and read at call time,
    // so hooks can be swapped while the endpoint is running.
    on_connected: Arc<RwLock<Option<ConnectedHook>>>,
    on_disconnected: Arc<RwLock<Option<DisconnectedHook>>>,
    on_read_message: Arc<RwLock<Option<ReadMessageHook>>>,
    gen_conn_id: Arc<RwLock<Option<GenConnIdHook>>>,

    acceptor: Mutex<Option<(Arc<AtomicBool>, JoinHandle<()>)>>,
    reaper: Mutex<Option<Ticker>>,
    gc: Mutex<Option<Ticker>>,

    log: Logger,
}

impl Endpoint {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(config: Config, log: L) -> Endpoint {
        let endpoint_log = match log.into() {
            Some(parent) => {
                parent.new(logging::o!("endpoint" => format!("{}:{}", config.host, config.port)))
            }
            None => logging::discard(),
        };

        let registry = Arc::new(Registry::new(&config.registry, &endpoint_log));
        let dispatcher = Arc::new(Dispatcher::new(&endpoint_log));

        Endpoint {
            config: RwLock::new(config),
            state: AtomicU8::new(STATE_INIT),
            registry,
            dispatcher,
            buckets: RwLock::new(Vec::new()),
            next_conn_id: Arc::new(AtomicI64::new(0)),
            local_addr: RwLock::new(None),
            on_connected: Arc::new(RwLock::new(None)),
            on_disconnected: Arc::new(RwLock::new(None)),
            on_read_message: Arc::new(RwLock::new(None)),
            gen_conn_id: Arc::new(RwLock::new(None)),
            acceptor: Mutex::new(None),
            reaper: Mutex::new(None),
            gc: Mutex::new(None),
            log: endpoint_log,
        }
    }

    #[inline]
    pub fn get_state(&self) -> EndpointState {
        match self.state.load(Ordering::Acquire) {
            STATE_INIT => EndpointState::Init,
            STATE_RUNNING => EndpointState::Running,
            STATE_STOPPING => EndpointState::Stopping,
            _ => EndpointState::Stopped,
        }
    }

    /// Address the listener actually bound, available once running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *read(&self.local_addr)
    }

    #[inline]
    pub fn get_registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn add_router(&self, msg_id: u32, router: Arc<dyn Router>) -> NetResult<()> {
        self.dispatcher.add_router(msg_id, router)
    }

    pub fn register_redirect(&self, router: Arc<dyn Router>) {
        self.dispatcher.register_redirect(router)
    }

    /// Queued dispatch entry point for applications that installed a read
    /// hook and want the worker pool to run the actual handling.
    pub fn send_to_queue(&self, req: Request) -> NetResult<()> {
        self.dispatcher.send_to_queue(req)
    }

    /// Creates an application broadcast group wired with the endpoint's
    /// defaults: the configured read rate and error message id.
    pub fn new_group(&self, group_id: GroupId) -> Group {
        let config = read(&self.config).clone();

        let group = Group::new(
            group_id,
            Duration::from_secs_f64(config.bucket_read_rate),
            &self.log,
        );
        if config.err_msg_id != 0 {
            group.set_err_msg_id(config.err_msg_id);
        }

        group
    }

    /// Fans a send request out through every bucket; each shard delivers to
    /// the members passing the request's filters.
    pub fn send_message(&self, req: SendRequest) -> NetResult<()> {
        if req.msg_id == 0 || req.data.is_empty() {
            return Err(NetError::Fatal(ErrorKind::InvalidArgument));
        }

        let buckets = read(&self.buckets).clone();
        if buckets.is_empty() {
            return Err(NetError::Fatal(ErrorKind::Closed));
        }

        for bucket in &buckets {
            bucket.send_message(req.clone())?;
        }
        Ok(())
    }

    // Pre-start setters; out-of-range values are ignored.

    pub fn set_max_connects(&self, max_connects: i64) {
        if max_connects <= 0 {
            return;
        }
        write(&self.config).max_connects = max_connects;
    }

    pub fn set_max_pack_size(&self, max_pack_size: u32) {
        if max_pack_size == 0 {
            return;
        }
        write(&self.config).max_pack_size = max_pack_size;
    }

    pub fn set_little_endian(&self, little_endian: bool) {
        write(&self.config).little_endian = little_endian;
    }

    pub fn set_handler_queues(&self, workers: usize) {
        if workers == 0 {
            return;
        }
        write(&self.config).dispatch.workers = workers;
    }

    pub fn set_connected(&self, hook: ConnectedHook) {
        *write(&self.on_connected) = Some(hook);
    }

    pub fn set_disconnected(&self, hook: DisconnectedHook) {
        *write(&self.on_disconnected) = Some(hook);
    }

    /// Replaces the default frame pipeline (direct dispatch) with a user
    /// hook.
    pub fn set_read_message(&self, hook: ReadMessageHook) {
        *write(&self.on_read_message) = Some(hook);
    }

    pub fn set_gen_conn_id(&self, hook: GenConnIdHook) {
        *write(&self.gen_conn_id) = Some(hook);
    }

    /// Binds the listener and spawns the acceptor, bucket, reaper and worker
    /// tasks. Valid only from `Init`; a failed start (bad config, unbindable
    /// address) rolls back so the caller can fix the config and retry.
    pub fn start(&self) -> NetResult<()> {
        if self
            .state
            .compare_exchange(STATE_INIT, STATE_RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(NetError::Fatal(ErrorKind::InvalidArgument));
        }

        self.start_tasks().map_err(|err| {
            self.state.store(STATE_INIT, Ordering::Release);
            err
        })
    }

    fn start_tasks(&self) -> NetResult<()> {
        let config = read(&self.config).clone();
        config.validate()?;

        let addr = resolve_addr(&config)?;
        let mut listener = TcpListener::bind(addr)?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        *write(&self.local_addr) = listener.local_addr().ok();

        let codec = Codec::new(config.little_endian, config.max_pack_size);

        // Buckets and their callbacks.
        let read_rate = Duration::from_secs_f64(config.bucket_read_rate);
        let buckets: Vec<Arc<Bucket>> = (0..config.bucket_count)
            .map(|id| Arc::new(Bucket::new(id, read_rate, &self.log)))
            .collect();

        self.dispatcher
            .spawn_workers(config.dispatch.workers, config.dispatch.queue_capacity);

        // A user read hook takes over the frame pipeline; otherwise frames go
        // straight to the dispatcher. The hook cell is consulted per frame.
        let dispatcher = self.dispatcher.clone();
        let read_hook_cell = self.on_read_message.clone();
        let read_cb: ReadCallback = Arc::new(move |conn, req| {
            match read(&read_hook_cell).clone() {
                Some(hook) => hook(conn, req),
                None => dispatcher.handle(&req),
            }
        });

        let registry = self.registry.clone();
        let disconnected_cell = self.on_disconnected.clone();
        let disconnect_cb: DisconnectCallback = Arc::new(move |conn| {
            registry.remove(conn.get_conn_id());
            if let Some(hook) = read(&disconnected_cell).clone() {
                hook(conn);
            }
        });

        for bucket in &buckets {
            bucket.set_cb_for_read_message(read_cb.clone());
            bucket.set_cb_for_disconnected(disconnect_cb.clone());
        }
        *write(&self.buckets) = buckets.clone();

        // Idle reaper: stale channels are routed through their owning
        // bucket's close-and-remove path.
        let reaper_registry = self.registry.clone();
        let reaper_buckets = buckets.clone();
        let reaper_log = self.log.new(logging::o!("component" => "reaper"));
        let tick_log = reaper_log.clone();
        *lock(&self.reaper) = Some(Ticker::spawn(
            "reaper",
            Duration::from_secs_f64(config.registry.reap_rate),
            reaper_log,
            move || {
                for conn in reaper_registry.stale() {
                    let conn_id = conn.get_conn_id();
                    logging::info!(tick_log, "reaping idle connection";
                                   "conn_id" => conn_id,
                                   "active_time" => conn.get_active_time());

                    let idx = (conn_id % reaper_buckets.len() as i64) as usize;
                    drop(reaper_buckets[idx].remove_connect(conn_id));
                    reaper_registry.remove(conn_id);
                }
            },
        ));

        // Periodic map compaction.
        let gc_buckets = buckets.clone();
        *lock(&self.gc) = Some(Ticker::spawn(
            "gc",
            Duration::from_secs_f64(config.gc_rate),
            self.log.new(logging::o!("component" => "gc")),
            move || {
                for bucket in &gc_buckets {
                    bucket.compact();
                }
            },
        ));

        // Acceptor task.
        let quit = Arc::new(AtomicBool::new(false));
        let ctx = AcceptCtx {
            listener,
            poll,
            quit: quit.clone(),
            registry: self.registry.clone(),
            buckets,
            next_conn_id: self.next_conn_id.clone(),
            gen_conn_id: self.gen_conn_id.clone(),
            on_connected: self.on_connected.clone(),
            codec,
            write_deadline: Duration::from_secs_f64(config.write_deadline),
            max_connects: config.max_connects,
            log: self.log.new(logging::o!("component" => "acceptor")),
        };
        let handle = thread::Builder::new()
            .name("acceptor".to_owned())
            .spawn(move || accept_loop(ctx))?;
        *lock(&self.acceptor) = Some((quit, handle));

        logging::info!(self.log, "endpoint started";
                       "addr" => format!("{:?}", self.local_addr()),
                       "buckets" => config.bucket_count);

        Ok(())
    }

    /// Cooperative shutdown: the acceptor, tickers and bucket tasks finish
    /// their in-flight work and exit; every member channel is closed with its
    /// disconnect hook fired exactly once.
    pub fn stop(&self) -> NetResult<()> {
        if self
            .state
            .compare_exchange(
                STATE_RUNNING,
                STATE_STOPPING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(NetError::Fatal(ErrorKind::InvalidArgument));
        }

        if let Some((quit, handle)) = lock(&self.acceptor).take() {
            quit.store(true, Ordering::Release);
            drop(handle.join());
        }

        if let Some(ticker) = lock(&self.reaper).take() {
            ticker.quit();
        }
        if let Some(ticker) = lock(&self.gc).take() {
            ticker.quit();
        }

        let buckets = std::mem::take(&mut *write(&self.buckets));
        for bucket in &buckets {
            bucket.quit();
        }

        self.dispatcher.quit();
        self.registry.clear();

        self.state.store(STATE_STOPPED, Ordering::Release);
        logging::info!(self.log, "endpoint stopped");

        Ok(())
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        drop(self.stop());
    }
}

/// Everything the acceptor task owns.
struct AcceptCtx {
    listener: TcpListener,
    poll: Poll,
    quit: Arc<AtomicBool>,
    registry: Arc<Registry>,
    buckets: Vec<Arc<Bucket>>,
    next_conn_id: Arc<AtomicI64>,
    gen_conn_id: Arc<RwLock<Option<GenConnIdHook>>>,
    on_connected: Arc<RwLock<Option<ConnectedHook>>>,
    codec: Codec,
    write_deadline: Duration,
    max_connects: i64,
    log: Logger,
}

fn accept_loop(mut ctx: AcceptCtx) {
    let mut events = Events::with_capacity(128);

    while !ctx.quit.load(Ordering::Acquire) {
        if let Err(err) = ctx.poll.poll(&mut events, Some(ACCEPT_POLL_TIMEOUT)) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            logging::error!(ctx.log, "listener poll failed"; "err" => format!("{:?}", err));
            continue;
        }

        // Drain the accept queue completely; readiness is edge-ish.
        loop {
            match ctx.listener.accept() {
                Ok((stream, peer)) => ctx.admit(stream, peer),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    logging::warn!(ctx.log, "accept failed"; "err" => format!("{:?}", err));
                    break;
                }
            }
        }
    }
}

impl AcceptCtx {
    fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        // Over the limit: skip and log. The refused socket is dropped without
        // ever being counted.
        if self.max_connects > 0 && self.registry.len() >= self.max_connects {
            logging::warn!(self.log, "connection limit reached, refusing";
                           "peer" => format!("{}", peer),
                           "max_connects" => self.max_connects);
            return;
        }

        let conn_id = self.allocate_conn_id();
        let conn = Arc::new(Channel::new(
            conn_id,
            stream,
            peer,
            self.codec.clone(),
            self.write_deadline,
            &self.log,
        ));

        if let Err(err) = self.registry.add(conn.clone()) {
            logging::warn!(self.log, "registration failed, dropping";
                           "conn_id" => conn_id,
                           "err" => format!("{:?}", err));
            conn.quit();
            return;
        }

        // A panicking user hook must not take the acceptor down.
        if let Some(hook) = read(&self.on_connected).clone() {
            let hooked = conn.clone();
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| hook(hooked))) {
                logging::error!(self.log, "connected hook panicked";
                                "conn_id" => conn_id,
                                "panic" => format!("{:?}", payload));
            }
        }

        let idx = (conn_id % self.buckets.len() as i64) as usize;
        if let Err(err) = self.buckets[idx].add_connect(conn.clone()) {
            logging::warn!(self.log, "bucket insert failed, dropping";
                           "conn_id" => conn_id,
                           "err" => format!("{:?}", err));
            self.registry.remove(conn_id);
            conn.quit();
            return;
        }

        logging::debug!(self.log, "connection accepted";
                        "conn_id" => conn_id,
                        "peer" => format!("{}", peer),
                        "bucket" => idx);
    }

    /// Id from the user hook when one is installed and well-behaved,
    /// otherwise the internal monotonic counter.
    fn allocate_conn_id(&self) -> ConnId {
        if let Some(hook) = read(&self.gen_conn_id).clone() {
            match panic::catch_unwind(AssertUnwindSafe(|| hook())) {
                Ok(conn_id) if conn_id > 0 => return conn_id,
                Ok(conn_id) => {
                    logging::warn!(self.log, "generated id rejected, using counter";
                                   "conn_id" => conn_id);
                }
                Err(payload) => {
                    logging::error!(self.log, "gen_conn_id hook panicked, using counter";
                                    "panic" => format!("{:?}", payload));
                }
            }
        }

        self.next_conn_id.fetch_add(1, Ordering::AcqRel) + 1
    }
}

fn resolve_addr(config: &Config) -> NetResult<SocketAddr> {
    let addrs = (config.host.as_str(), config.port).to_socket_addrs()?;

    addrs
        .into_iter()
        .find(|addr| match config.tcp_version {
            TcpVersion::Tcp => true,
            TcpVersion::Tcp4 => addr.is_ipv4(),
            TcpVersion::Tcp6 => addr.is_ipv6(),
        })
        .ok_or(NetError::Fatal(ErrorKind::NotFound))
}
