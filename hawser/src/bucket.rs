use crate::channel::Channel;
use crate::dispatch::Request;
use crate::shared::{read, write, ConnId, ErrorKind, NetError, NetResult};
use indexmap::IndexMap;
use marline::logging::{self, Logger};
use marline::queue::Queue;
use marline::ticker::Ticker;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Directed fan-out request processed by a bucket's send consumer. A
/// non-empty `conn_ids` restricts delivery to those ids; otherwise a
/// non-empty `tags` restricts it to channels carrying any of the tags; with
/// both empty the frame goes to every channel in the bucket.
#[derive(Debug, Clone, Default)]
pub struct SendRequest {
    pub msg_id: u32,
    pub data: Vec<u8>,
    pub conn_ids: Vec<ConnId>,
    pub tags: Vec<String>,
}

pub type ReadCallback = Arc<dyn Fn(Arc<Channel>, Request) -> NetResult<()> + Send + Sync>;
pub type DisconnectCallback = Arc<dyn Fn(Arc<Channel>) + Send + Sync>;

/// One shard of the connection space. The bucket owns its member channels: a
/// periodic tick reads at most one frame per member (a hot client cannot
/// starve the shard), a single consumer task applies queued fan-out requests
/// in order, and shutting the bucket down closes every member.
pub struct Bucket {
    core: Arc<BucketCore>,
    read_ticker: Ticker,
    send_queue: Queue<SendRequest>,
}

struct BucketCore {
    id: usize,
    conns: RwLock<IndexMap<ConnId, Arc<Channel>>>,
    conn_count: AtomicI64,
    cb_read: RwLock<Option<ReadCallback>>,
    cb_disconnected: RwLock<Option<DisconnectCallback>>,
    log: Logger,
}

impl Bucket {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        id: usize,
        read_rate: Duration,
        log: L,
    ) -> Bucket {
        let bucket_log = match log.into() {
            Some(parent) => parent.new(logging::o!("bucket" => id)),
            None => logging::discard(),
        };

        let core = Arc::new(BucketCore {
            id,
            conns: RwLock::new(IndexMap::new()),
            conn_count: AtomicI64::new(0),
            cb_read: RwLock::new(None),
            cb_disconnected: RwLock::new(None),
            log: bucket_log,
        });

        let tick_core = core.clone();
        let read_ticker = Ticker::spawn(
            &format!("bucket-{}-read", id),
            read_rate,
            core.log.clone(),
            move || tick_core.read_tick(),
        );

        let consumer_core = core.clone();
        let send_queue = Queue::spawn(
            &format!("bucket-{}-send", id),
            core.log.clone(),
            move |req| consumer_core.consume(req),
        );

        Bucket {
            core,
            read_ticker,
            send_queue,
        }
    }

    #[inline]
    pub fn get_id(&self) -> usize {
        self.core.id
    }

    #[inline]
    pub fn len(&self) -> i64 {
        self.core.conn_count.load(Ordering::Acquire)
    }

    pub fn get_connect(&self, conn_id: ConnId) -> NetResult<Arc<Channel>> {
        if conn_id <= 0 {
            return Err(NetError::Fatal(ErrorKind::InvalidArgument));
        }

        read(&self.core.conns)
            .get(&conn_id)
            .cloned()
            .ok_or(NetError::Fatal(ErrorKind::NotFound))
    }

    /// Takes ownership of a channel. Rejects non-positive ids and ids already
    /// present in the shard.
    pub fn add_connect(&self, conn: Arc<Channel>) -> NetResult<()> {
        let conn_id = conn.get_conn_id();
        if conn_id <= 0 {
            return Err(NetError::Fatal(ErrorKind::InvalidArgument));
        }

        let mut conns = write(&self.core.conns);
        if conns.contains_key(&conn_id) {
            return Err(NetError::Fatal(ErrorKind::AlreadyExists));
        }

        conns.insert(conn_id, conn);
        self.core.conn_count.fetch_add(1, Ordering::AcqRel);

        Ok(())
    }

    /// Closes and removes a member. Removing an id the bucket does not hold
    /// is a no-op.
    pub fn remove_connect(&self, conn_id: ConnId) -> NetResult<()> {
        if conn_id <= 0 {
            return Err(NetError::Fatal(ErrorKind::InvalidArgument));
        }

        let conn = match read(&self.core.conns).get(&conn_id).cloned() {
            Some(conn) => conn,
            None => return Ok(()),
        };

        self.core.close_conn(&conn);
        Ok(())
    }

    /// Enqueues a fan-out request for the send consumer.
    pub fn send_message(&self, req: SendRequest) -> NetResult<()> {
        if req.msg_id == 0 || req.data.is_empty() {
            return Err(NetError::Fatal(ErrorKind::InvalidArgument));
        }

        self.send_queue
            .push(req)
            .map_err(|_| NetError::Fatal(ErrorKind::Closed))
    }

    pub fn set_cb_for_read_message(&self, cb: ReadCallback) {
        *write(&self.core.cb_read) = Some(cb);
    }

    pub fn set_cb_for_disconnected(&self, cb: DisconnectCallback) {
        *write(&self.core.cb_disconnected) = Some(cb);
    }

    /// Reallocates the member map once the shard has emptied out.
    pub fn compact(&self) {
        if self.core.conn_count.load(Ordering::Acquire) > 0 {
            return;
        }

        let mut conns = write(&self.core.conns);
        if conns.is_empty() {
            *conns = IndexMap::new();
        }
    }

    /// Stops the read ticker, drains the send consumer and closes every
    /// member channel, firing the disconnect callback for each.
    pub fn quit(&self) {
        self.read_ticker.quit();
        self.send_queue.quit();

        let members: Vec<Arc<Channel>> = read(&self.core.conns).values().cloned().collect();
        for conn in &members {
            self.core.close_conn(conn);
        }

        logging::debug!(self.core.log, "bucket stopped";
                        "context" => "quit",
                        "closed" => members.len());
    }
}

impl BucketCore {
    /// One pass over the shard: at most one frame per member. Fatal read
    /// errors evict the member; callback errors are logged and the member
    /// stays.
    fn read_tick(&self) {
        if self.conn_count.load(Ordering::Acquire) <= 0 {
            return;
        }

        let members: Vec<Arc<Channel>> = read(&self.conns).values().cloned().collect();
        let cb_read = read(&self.cb_read).clone();

        for conn in members {
            match conn.read_message() {
                Ok(message) => {
                    if let Some(cb) = &cb_read {
                        let req = Request::new(conn.clone(), message);
                        if let Err(err) = cb(conn.clone(), req) {
                            logging::warn!(self.log, "read callback failed";
                                           "context" => "read_tick",
                                           "conn_id" => conn.get_conn_id(),
                                           "err" => format!("{:?}", err));
                        }
                    }
                }
                Err(NetError::Wait) => (),
                Err(err) => {
                    logging::debug!(self.log, "read failed, evicting";
                                    "context" => "read_tick",
                                    "conn_id" => conn.get_conn_id(),
                                    "err" => format!("{:?}", err));
                    self.close_conn(&conn);
                }
            }
        }
    }

    /// Applies one fan-out request to the current membership. Send failures
    /// are logged and the fan-out continues; the next read on a broken
    /// channel surfaces the failure.
    fn consume(&self, req: SendRequest) {
        let members: Vec<Arc<Channel>> = read(&self.conns).values().cloned().collect();

        for conn in members {
            if !Self::send_allowed(&req, &conn) {
                continue;
            }

            if let Err(err) = conn.send_message(req.msg_id, &req.data) {
                logging::warn!(self.log, "fan-out send failed";
                               "context" => "consume",
                               "conn_id" => conn.get_conn_id(),
                               "msg_id" => req.msg_id,
                               "err" => format!("{:?}", err));
            }
        }
    }

    /// The authoritative fan-out filter: explicit ids first, then any-match
    /// on tags, else broadcast.
    fn send_allowed(req: &SendRequest, conn: &Channel) -> bool {
        if !req.conn_ids.is_empty() {
            return req.conn_ids.contains(&conn.get_conn_id());
        }
        if !req.tags.is_empty() {
            return conn.has_any_tag(&req.tags);
        }
        true
    }

    /// Closes a member exactly once, fires the disconnect callback for the
    /// closing call, and drops it from the shard. An emptied shard gets a
    /// fresh map so a burst of departures returns its memory.
    fn close_conn(&self, conn: &Arc<Channel>) {
        if conn.quit() {
            if let Some(cb) = read(&self.cb_disconnected).clone() {
                cb(conn.clone());
            }
        }

        let mut conns = write(&self.conns);
        if conns.swap_remove(&conn.get_conn_id()).is_some() {
            let left = self.conn_count.fetch_sub(1, Ordering::AcqRel) - 1;
            if left <= 0 && conns.is_empty() {
                *conns = IndexMap::new();
                logging::debug!(self.log, "bucket emptied, map reallocated";
                                "context" => "close_conn");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Codec, Message, HEADER_SIZE};
    use mio::net::TcpStream;
    use std::io::{Read as _, Write as _};
    use std::net::{TcpListener, TcpStream as StdTcpStream};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::thread;

    const MAX_PACK: u32 = 64;
    const TICK: Duration = Duration::from_millis(10);

    fn codec() -> Codec {
        Codec::new(true, MAX_PACK)
    }

    fn socket_pair(conn_id: ConnId) -> (Arc<Channel>, StdTcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = StdTcpStream::connect(addr).unwrap();
        let (accepted, peer) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();

        let conn = Arc::new(Channel::new(
            conn_id,
            TcpStream::from_std(accepted),
            peer,
            codec(),
            Duration::from_secs(1),
            None,
        ));

        (conn, client)
    }

    fn read_frame(client: &mut StdTcpStream) -> Message {
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        let mut header = [0u8; HEADER_SIZE];
        client.read_exact(&mut header).unwrap();
        let mut message = codec().unpack(&header).unwrap();

        let mut data = vec![0u8; message.get_len() as usize];
        client.read_exact(&mut data).unwrap();
        message.set_data(data);
        message
    }

    fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
        for _ in 0..300 {
            if cond() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("timed out waiting for {}", what);
    }

    #[test]
    fn test_add_get_remove() {
        let bucket = Bucket::new(0, TICK, None);
        let (conn, _client) = socket_pair(1);

        bucket.add_connect(conn.clone()).unwrap();
        assert_eq!(bucket.len(), 1);
        assert_eq!(bucket.get_connect(1).unwrap().get_conn_id(), 1);

        assert_eq!(
            bucket.add_connect(conn).unwrap_err(),
            NetError::Fatal(ErrorKind::AlreadyExists)
        );

        bucket.remove_connect(1).unwrap();
        assert_eq!(bucket.len(), 0);
        assert_eq!(
            bucket.get_connect(1).unwrap_err(),
            NetError::Fatal(ErrorKind::NotFound)
        );

        // Removing again is a no-op.
        bucket.remove_connect(1).unwrap();
        bucket.quit();
    }

    #[test]
    fn test_remove_closes_the_channel() {
        let bucket = Bucket::new(0, TICK, None);
        let (conn, _client) = socket_pair(1);
        bucket.add_connect(conn.clone()).unwrap();

        bucket.remove_connect(1).unwrap();

        assert_eq!(conn.get_state(), crate::channel::ChannelState::Closed);
        bucket.quit();
    }

    #[test]
    fn test_read_tick_feeds_the_callback() {
        let bucket = Bucket::new(0, TICK, None);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bucket.set_cb_for_read_message(Arc::new(move |conn, req| {
            sink.lock()
                .unwrap()
                .push((conn.get_conn_id(), req.get_message().get_id()));
            Ok(())
        }));

        let (conn, mut client) = socket_pair(1);
        bucket.add_connect(conn).unwrap();

        let bytes = codec().pack(&Message::new(5, b"ping".to_vec())).unwrap();
        client.write_all(&bytes).unwrap();

        wait_until("frame to reach the callback", || !seen.lock().unwrap().is_empty());
        assert_eq!(seen.lock().unwrap()[0], (1, 5));
        bucket.quit();
    }

    #[test]
    fn test_peer_close_evicts_and_fires_disconnect_once() {
        let bucket = Bucket::new(0, TICK, None);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        bucket.set_cb_for_disconnected(Arc::new(move |_conn| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let (conn, client) = socket_pair(1);
        bucket.add_connect(conn).unwrap();

        drop(client);

        wait_until("eviction", || bucket.len() == 0);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        bucket.quit();
    }

    #[test]
    fn test_oversize_frame_evicts() {
        let bucket = Bucket::new(0, TICK, None);
        let (conn, mut client) = socket_pair(1);
        bucket.add_connect(conn).unwrap();

        let oversize = Codec::new(true, 2048)
            .pack(&Message::new(1, vec![0; MAX_PACK as usize + 1]))
            .unwrap();
        client.write_all(&oversize).unwrap();

        wait_until("oversize eviction", || bucket.len() == 0);
        bucket.quit();
    }

    #[test]
    fn test_broadcast_reaches_every_member() {
        let bucket = Bucket::new(0, TICK, None);
        let (conn_a, mut client_a) = socket_pair(1);
        let (conn_b, mut client_b) = socket_pair(2);
        bucket.add_connect(conn_a).unwrap();
        bucket.add_connect(conn_b).unwrap();

        bucket
            .send_message(SendRequest {
                msg_id: 9,
                data: b"all".to_vec(),
                ..SendRequest::default()
            })
            .unwrap();

        assert_eq!(read_frame(&mut client_a).get_data(), b"all");
        assert_eq!(read_frame(&mut client_b).get_data(), b"all");
        bucket.quit();
    }

    #[test]
    fn test_conn_id_filter_beats_tags() {
        let bucket = Bucket::new(0, TICK, None);
        let (conn_a, mut client_a) = socket_pair(1);
        let (conn_b, mut client_b) = socket_pair(2);
        conn_b.add_tag("vip").unwrap();
        bucket.add_connect(conn_a).unwrap();
        bucket.add_connect(conn_b).unwrap();

        bucket
            .send_message(SendRequest {
                msg_id: 9,
                data: b"direct".to_vec(),
                conn_ids: vec![1],
                tags: vec!["vip".to_owned()],
            })
            .unwrap();

        assert_eq!(read_frame(&mut client_a).get_data(), b"direct");

        client_b
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        let mut byte = [0u8; 1];
        assert!(client_b.read_exact(&mut byte).is_err());
        bucket.quit();
    }

    #[test]
    fn test_tag_filter_matches_any() {
        let bucket = Bucket::new(0, TICK, None);
        let (conn_a, mut client_a) = socket_pair(1);
        let (conn_b, mut client_b) = socket_pair(2);
        let (conn_c, mut client_c) = socket_pair(3);
        conn_a.add_tag("vip").unwrap();
        conn_b.add_tag("vip").unwrap();
        conn_b.add_tag("beta").unwrap();
        bucket.add_connect(conn_a).unwrap();
        bucket.add_connect(conn_b).unwrap();
        bucket.add_connect(conn_c).unwrap();

        bucket
            .send_message(SendRequest {
                msg_id: 4,
                data: b"x".to_vec(),
                tags: vec!["vip".to_owned()],
                ..SendRequest::default()
            })
            .unwrap();

        assert_eq!(read_frame(&mut client_a).get_data(), b"x");
        assert_eq!(read_frame(&mut client_b).get_data(), b"x");

        client_c
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        let mut byte = [0u8; 1];
        assert!(client_c.read_exact(&mut byte).is_err());
        bucket.quit();
    }

    #[test]
    fn test_send_message_validates_the_request() {
        let bucket = Bucket::new(0, TICK, None);

        assert_eq!(
            bucket
                .send_message(SendRequest {
                    msg_id: 0,
                    data: b"x".to_vec(),
                    ..SendRequest::default()
                })
                .unwrap_err(),
            NetError::Fatal(ErrorKind::InvalidArgument)
        );
        assert_eq!(
            bucket
                .send_message(SendRequest {
                    msg_id: 1,
                    ..SendRequest::default()
                })
                .unwrap_err(),
            NetError::Fatal(ErrorKind::InvalidArgument)
        );
        bucket.quit();
    }

    #[test]
    fn test_quit_closes_members_and_fires_hooks() {
        let bucket = Bucket::new(0, TICK, None);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        bucket.set_cb_for_disconnected(Arc::new(move |_conn| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let (conn_a, _client_a) = socket_pair(1);
        let (conn_b, _client_b) = socket_pair(2);
        bucket.add_connect(conn_a.clone()).unwrap();
        bucket.add_connect(conn_b.clone()).unwrap();

        bucket.quit();

        assert_eq!(bucket.len(), 0);
        assert_eq!(conn_a.get_state(), crate::channel::ChannelState::Closed);
        assert_eq!(conn_b.get_state(), crate::channel::ChannelState::Closed);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_send_after_quit_is_refused() {
        let bucket = Bucket::new(0, TICK, None);
        bucket.quit();

        assert_eq!(
            bucket
                .send_message(SendRequest {
                    msg_id: 1,
                    data: b"x".to_vec(),
                    ..SendRequest::default()
                })
                .unwrap_err(),
            NetError::Fatal(ErrorKind::Closed)
        );
    }
}
