use crate::channel::Channel;
use crate::frame::Message;
use crate::shared::{lock, read, write, ErrorKind, NetError, NetResult};
use hashbrown::HashMap;
use marline::logging::{self, Logger};
use rand::Rng;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};

/// Hard cap on the handler worker pool.
pub const WORKER_MAX: usize = 128;

/// Three-phase message handler. Every phase defaults to a no-op so routers
/// override only the hooks they need.
pub trait Router: Send + Sync {
    fn pre_handle(&self, _req: &Request) {}
    fn handle(&self, _req: &Request) {}
    fn post_handle(&self, _req: &Request) {}
}

/// One decoded frame bound to the channel it arrived on.
#[derive(Clone)]
pub struct Request {
    conn: Arc<Channel>,
    message: Message,
}

impl Request {
    #[inline]
    pub fn new(conn: Arc<Channel>, message: Message) -> Request {
        Request { conn, message }
    }

    #[inline]
    pub fn get_connect(&self) -> &Arc<Channel> {
        &self.conn
    }

    #[inline]
    pub fn get_message(&self) -> &Message {
        &self.message
    }
}

/// Message-id → router table plus the optional redirect catch-all. Written
/// during setup, read on every dispatch.
struct RouteTable {
    routes: RwLock<HashMap<u32, Arc<dyn Router>>>,
    redirect: RwLock<Option<Arc<dyn Router>>>,
    log: Logger,
}

impl RouteTable {
    /// Resolves the router for the request and runs the three phases on the
    /// calling thread. A panicking hook is caught, logged, and reported as a
    /// failure of this request only.
    fn dispatch(&self, req: &Request) -> NetResult<()> {
        let msg_id = req.get_message().get_id();

        let router = match read(&self.routes).get(&msg_id).cloned() {
            Some(router) => router,
            None => match read(&self.redirect).clone() {
                Some(router) => router,
                None => {
                    logging::warn!(self.log, "no handler for message";
                                   "context" => "dispatch",
                                   "msg_id" => msg_id);
                    return Err(NetError::Fatal(ErrorKind::HandlerMissing));
                }
            },
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            router.pre_handle(req);
            router.handle(req);
            router.post_handle(req);
        }));

        match outcome {
            Ok(()) => Ok(()),
            Err(payload) => {
                logging::error!(self.log, "router panicked";
                                "context" => "dispatch",
                                "msg_id" => msg_id,
                                "conn_id" => req.get_connect().get_conn_id(),
                                "panic" => format!("{:?}", payload));
                Err(NetError::Fatal(ErrorKind::Panic))
            }
        }
    }
}

/// Maps message ids to routers and drives the two dispatch paths: direct
/// (`handle`, on the caller) and queued (`send_to_queue`, on a fixed pool of
/// workers fed through bounded channels).
pub struct Dispatcher {
    table: Arc<RouteTable>,
    workers: Mutex<Vec<Worker>>,
}

impl Dispatcher {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> Dispatcher {
        let dispatch_log = match log.into() {
            Some(parent) => parent.new(logging::o!("component" => "dispatch")),
            None => logging::discard(),
        };

        Dispatcher {
            table: Arc::new(RouteTable {
                routes: RwLock::new(HashMap::new()),
                redirect: RwLock::new(None),
                log: dispatch_log,
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Registers a router for a message id. A zero id is rejected; repeated
    /// registration for the same id is a no-op, the first router wins.
    pub fn add_router(&self, msg_id: u32, router: Arc<dyn Router>) -> NetResult<()> {
        if msg_id == 0 {
            return Err(NetError::Fatal(ErrorKind::InvalidArgument));
        }

        let mut routes = write(&self.table.routes);
        if routes.contains_key(&msg_id) {
            return Ok(());
        }

        routes.insert(msg_id, router);
        Ok(())
    }

    /// Installs the catch-all router for unrouted message ids.
    pub fn register_redirect(&self, router: Arc<dyn Router>) {
        *write(&self.table.redirect) = Some(router);
    }

    /// Direct dispatch on the calling thread.
    #[inline]
    pub fn handle(&self, req: &Request) -> NetResult<()> {
        self.table.dispatch(req)
    }

    /// Spawns the worker pool. Idempotent: a live pool is left untouched.
    pub fn spawn_workers(&self, count: usize, queue_capacity: usize) {
        let mut workers = lock(&self.workers);
        if !workers.is_empty() {
            return;
        }

        let count = count.clamp(1, WORKER_MAX);
        for idx in 0..count {
            workers.push(Worker::spawn(idx, queue_capacity, self.table.clone()));
        }
    }

    /// Queued dispatch: hands the request to a uniformly random worker
    /// without blocking. A full worker queue drops the request.
    pub fn send_to_queue(&self, req: Request) -> NetResult<()> {
        let workers = lock(&self.workers);
        if workers.is_empty() {
            return Err(NetError::Fatal(ErrorKind::Closed));
        }

        let idx = rand::thread_rng().gen_range(0..workers.len());
        let result = workers[idx].try_push(req);

        if let Err(NetError::Fatal(ErrorKind::QueueFull)) = result {
            logging::error!(self.table.log, "worker queue full, request dropped";
                            "context" => "send_to_queue",
                            "worker" => idx);
        }

        result
    }

    /// Stops the pool; each worker drains its queue before exiting.
    pub fn quit(&self) {
        for worker in lock(&self.workers).drain(..) {
            worker.quit();
        }
    }
}

struct Worker {
    tx: Option<SyncSender<Request>>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(idx: usize, queue_capacity: usize, table: Arc<RouteTable>) -> Worker {
        let (tx, rx) = mpsc::sync_channel::<Request>(queue_capacity);

        let handle = thread::Builder::new()
            .name(format!("handler-worker-{}", idx))
            .spawn(move || {
                // Iteration keeps yielding buffered requests after the sender
                // is dropped: drain-then-exit shutdown.
                for req in rx {
                    if let Err(err) = table.dispatch(&req) {
                        logging::warn!(table.log, "queued dispatch failed";
                                       "context" => "worker",
                                       "worker" => idx,
                                       "err" => format!("{:?}", err));
                    }
                }
            })
            .expect("handler worker thread must spawn");

        Worker {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    fn try_push(&self, req: Request) -> NetResult<()> {
        let tx = match self.tx.as_ref() {
            Some(tx) => tx,
            None => return Err(NetError::Fatal(ErrorKind::Closed)),
        };

        match tx.try_send(req) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(NetError::Fatal(ErrorKind::QueueFull)),
            Err(TrySendError::Disconnected(_)) => Err(NetError::Fatal(ErrorKind::Closed)),
        }
    }

    fn quit(mut self) {
        drop(self.tx.take());
        if let Some(handle) = self.handle.take() {
            drop(handle.join());
        }
    }
}
