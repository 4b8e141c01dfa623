/*!
 * Request/Message Pooling
 *
 * `Request` pairs one outgoing RESP command with the reply the backend
 * eventually fills in, plus the merge mode used to fold multi-key
 * sub-replies back into one client-visible reply. `Message` is the unit of
 * client work: a batch of one or more Requests sharing a [`WaitGroup`] that
 * the client handler blocks on before encoding anything. Both are pooled —
 * `get_msgs`/`put_msgs` mirror the reference implementation's `sync.Pool`
 * pair, trading a little unsafe-free bookkeeping for avoiding an allocation
 * on every decoded command.
 */

use crate::error::{ProxyError, Result};
use crate::resp::{Resp, RESP_ARRAY, RESP_BULK};
use parking_lot::{Condvar, Mutex};
use smol_str::SmolStr;
use std::sync::Arc;
use std::time::Instant;

/// How N per-key sub-replies collapse into one client-visible reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeType {
    No,
    Ok,
    Join,
    Count,
}

const CMD_MSET: &[u8] = b"MSET";
const CMD_MGET: &[u8] = b"MGET";
const CMD_DEL: &[u8] = b"DEL";
const CMD_EXISTS: &[u8] = b"EXISTS";
pub(crate) const CMD_AUTH: &[u8] = b"AUTH";
pub(crate) const CMD_PING: &[u8] = b"PING";
pub(crate) const CMD_QUIT: &[u8] = b"QUIT";
pub(crate) const CMD_COMMAND: &[u8] = b"COMMAND";

/// Commands this proxy is willing to forward. Not exhaustive of Redis —
/// curated from the common data-access surface; anything outside this set
/// gets `-ERR unknown command`.
const SUPPORTED_COMMANDS: &[&[u8]] = &[
    b"GET", b"SET", b"SETNX", b"SETEX", b"PSETEX", b"APPEND", b"STRLEN",
    CMD_DEL, b"EXPIRE", b"PEXPIRE", b"TTL", b"PTTL", b"PERSIST", b"TYPE",
    b"INCR", b"INCRBY", b"DECR", b"DECRBY", CMD_MGET, CMD_MSET, b"MSETNX", b"GETSET",
    CMD_EXISTS, b"HGET", b"HSET", b"HDEL", b"HGETALL", b"HMGET", b"HMSET", b"HEXISTS",
    b"LPUSH", b"RPUSH", b"LPOP", b"RPOP", b"LRANGE", b"LLEN",
    b"SADD", b"SREM", b"SMEMBERS", b"SCARD", b"SISMEMBER",
    b"ZADD", b"ZREM", b"ZSCORE", b"ZRANGE", b"ZCARD",
    CMD_PING, CMD_AUTH, CMD_QUIT, CMD_COMMAND, b"SELECT",
];

/// One sub-command bound for a single backend key.
#[derive(Debug, Clone)]
pub struct Request {
    pub resp: Resp,
    pub reply: Resp,
    pub merge_type: MergeType,
}

impl Default for Request {
    fn default() -> Self {
        Request {
            resp: Resp::new(),
            reply: Resp::new(),
            merge_type: MergeType::No,
        }
    }
}

impl Request {
    pub fn reset(&mut self) {
        self.resp.reset();
        self.reply.reset();
        self.merge_type = MergeType::No;
    }

    /// The command token, e.g. `GET`. Empty if the request isn't a
    /// well-formed array command (inline decode always produces one).
    pub fn cmd(&self) -> &[u8] {
        self.resp
            .array()
            .first()
            .map(|r| r.data.as_slice())
            .unwrap_or(&[])
    }

    pub fn cmd_string(&self) -> String {
        String::from_utf8_lossy(self.cmd()).to_string()
    }

    /// The routing key: the second array element, for every command this
    /// proxy forwards (including the post-split MGET/MSET/DEL/EXISTS
    /// sub-requests, which are always exactly `<cmd> <key> [value]`).
    pub fn key(&self) -> &[u8] {
        self.resp
            .array()
            .get(1)
            .map(|r| r.data.as_slice())
            .unwrap_or(&[])
    }

    pub fn is_support(&self) -> bool {
        let cmd = self.cmd();
        SUPPORTED_COMMANDS.iter().any(|c| c.eq_ignore_ascii_case(cmd))
    }

    pub fn is_special(&self) -> bool {
        let cmd = self.cmd();
        cmd.eq_ignore_ascii_case(CMD_AUTH)
            || cmd.eq_ignore_ascii_case(CMD_PING)
            || cmd.eq_ignore_ascii_case(CMD_QUIT)
            || cmd.eq_ignore_ascii_case(CMD_COMMAND)
    }
}

/// Free-function form of [`Request::is_support`], usable before a command
/// has been wrapped in a `Request` (e.g. the handler's pre-split cmd check).
pub(crate) fn is_supported_command(cmd: &[u8]) -> bool {
    SUPPORTED_COMMANDS.iter().any(|c| c.eq_ignore_ascii_case(cmd))
}

/// Free-function form of [`Request::is_special`].
pub(crate) fn is_special_command(cmd: &[u8]) -> bool {
    cmd.eq_ignore_ascii_case(CMD_AUTH)
        || cmd.eq_ignore_ascii_case(CMD_PING)
        || cmd.eq_ignore_ascii_case(CMD_QUIT)
        || cmd.eq_ignore_ascii_case(CMD_COMMAND)
}

pub(crate) fn is_mset(cmd: &[u8]) -> bool {
    cmd.eq_ignore_ascii_case(CMD_MSET)
}
pub(crate) fn is_mget(cmd: &[u8]) -> bool {
    cmd.eq_ignore_ascii_case(CMD_MGET)
}
pub(crate) fn is_del_or_exists(cmd: &[u8]) -> bool {
    cmd.eq_ignore_ascii_case(CMD_DEL) || cmd.eq_ignore_ascii_case(CMD_EXISTS)
}

/// A thread-blocking completion barrier shared by every Request pushed for
/// one decoded batch. The handler's `Forward` call increments it once per
/// pushed sub-request; each pipeline worker decrements it when that
/// sub-request's reply (or error) is ready. `wait()` blocks the handler
/// thread until the count returns to zero.
#[derive(Default)]
pub struct WaitGroup {
    count: Mutex<usize>,
    cv: Condvar,
}

impl WaitGroup {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, n: usize) {
        *self.count.lock() += n;
    }

    pub fn done(&self) {
        let mut c = self.count.lock();
        debug_assert!(*c > 0, "WaitGroup::done called more times than add");
        if *c > 0 {
            *c -= 1;
        }
        if *c == 0 {
            self.cv.notify_all();
        }
    }

    pub fn wait(&self) {
        let mut c = self.count.lock();
        while *c > 0 {
            self.cv.wait(&mut c);
        }
    }
}

/// One client-visible unit of work: either a single command or (after
/// splitting) a batch of per-key sub-requests sharing one `WaitGroup`.
pub struct Message {
    req: Vec<Request>,
    req_num: usize,
    subs: Vec<Message>,
    wg: Option<Arc<WaitGroup>>,

    start: Option<Instant>,
    write: Option<Instant>,
    read: Option<Instant>,
    end: Option<Instant>,
    start_pipe: Option<Instant>,
    end_pipe: Option<Instant>,

    addr: SmolStr,
    err: Option<ProxyError>,
}

impl Default for Message {
    fn default() -> Self {
        Message {
            req: Vec::new(),
            req_num: 0,
            subs: Vec::new(),
            wg: None,
            start: None,
            write: None,
            read: None,
            end: None,
            start_pipe: None,
            end_pipe: None,
            addr: SmolStr::default(),
            err: None,
        }
    }
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.req_num = 0;
        self.start = None;
        self.write = None;
        self.read = None;
        self.end = None;
        self.start_pipe = None;
        self.end_pipe = None;
        self.addr = SmolStr::default();
        self.err = None;
    }

    fn clear(&mut self) {
        self.reset();
        self.req.clear();
        self.wg = None;
        self.subs.clear();
    }

    pub fn with_wait_group(&mut self, wg: Arc<WaitGroup>) {
        self.wg = Some(wg);
    }

    pub fn add(&self) {
        if let Some(wg) = &self.wg {
            wg.add(1);
        }
    }

    pub fn done(&self) {
        if let Some(wg) = &self.wg {
            wg.done();
        }
    }

    pub fn mark_start(&mut self) {
        self.start = Some(Instant::now());
    }
    pub fn mark_write(&mut self) {
        self.write = Some(Instant::now());
    }
    pub fn mark_read(&mut self) {
        self.read = Some(Instant::now());
    }
    pub fn mark_end(&mut self) {
        self.end = Some(Instant::now());
    }
    pub fn mark_start_pipe(&mut self) {
        self.start_pipe = Some(Instant::now());
    }
    pub fn mark_end_pipe(&mut self) {
        self.end_pipe = Some(Instant::now());
    }
    pub fn mark_addr(&mut self, addr: &str) {
        self.addr = SmolStr::new(addr);
    }
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn total_dur(&self) -> Option<std::time::Duration> {
        Some(self.end?.duration_since(self.start?))
    }

    /// Append a freshly decoded Request, growing the backing vec if the
    /// pooled Message hasn't been used for this many sub-requests before.
    pub fn with_request(&mut self, req: Request) {
        self.req.push(req);
        self.req_num += 1;
    }

    /// Reuse (or append) the next request slot during decode, returning it
    /// reset and ready to be filled in.
    pub fn next_req_slot(&mut self) -> &mut Request {
        if self.req_num < self.req.len() {
            self.req[self.req_num].reset();
        } else {
            self.req.push(Request::default());
        }
        self.req_num += 1;
        let i = self.req_num - 1;
        &mut self.req[i]
    }

    fn set_request(&mut self, req: Request) {
        self.req.clear();
        self.req_num = 0;
        self.with_request(req);
    }

    pub fn request(&self) -> Option<&Request> {
        self.req.first()
    }

    pub fn request_mut(&mut self) -> Option<&mut Request> {
        self.req.first_mut()
    }

    pub fn requests(&self) -> &[Request] {
        if self.req_num == 0 {
            &[]
        } else {
            &self.req[..self.req_num]
        }
    }

    pub fn is_batch(&self) -> bool {
        self.req_num > 1
    }

    /// True once a reply has already been filled in directly (e.g. by the
    /// handler's `cmd_check`) without ever being routed to a backend. The
    /// forwarder uses this to skip messages that don't need dispatching.
    pub fn is_already_answered(&self) -> bool {
        self.requests()
            .first()
            .map(|r| r.reply.resp_type != crate::resp::RESP_UNKNOWN)
            .unwrap_or(false)
    }

    /// Return one sub-Message per Request, reusing `subs` across decodes.
    pub fn batch(&mut self) -> &mut [Message] {
        let slen = self.req_num;
        if slen == 0 {
            return &mut [];
        }
        let min = self.subs.len().min(slen);
        for i in 0..min {
            let req = self.req[i].clone();
            self.subs[i].set_request(req);
        }
        while self.subs.len() < slen {
            let idx = self.subs.len();
            let mut msg = Message::new();
            msg.start = self.start;
            msg.set_request(self.req[idx].clone());
            if let Some(wg) = &self.wg {
                msg.with_wait_group(Arc::clone(wg));
            }
            self.subs.push(msg);
        }
        &mut self.subs[..slen]
    }

    pub fn reset_subs(&mut self) {
        if !self.is_batch() {
            return;
        }
        for sub in self.subs[..self.req_num].iter_mut() {
            sub.reset();
        }
        self.req_num = 0;
    }

    pub fn with_error(&mut self, err: Option<ProxyError>) {
        self.err = err;
    }

    pub fn err(&self) -> Option<ProxyError> {
        if self.err.is_some() {
            return self.err.clone();
        }
        if !self.is_batch() {
            return None;
        }
        self.subs[..self.req_num.min(self.subs.len())].iter().find_map(|s| s.err.clone())
    }

    /// Copy each split sub-request's filled-in reply back from `subs` into
    /// this message's own request slots. `forward`
    /// routes a batch's sub-requests as independent `subs` entries so each
    /// can be pushed to a different node's pipe; the reply only lands on
    /// that `subs` copy, so the handler calls this once the wait-group
    /// clears and before encoding. No-op for a non-batch message, whose
    /// single request was pushed directly and filled in place.
    pub fn sync_subs(&mut self) {
        if !self.is_batch() {
            return;
        }
        let n = self.req_num.min(self.subs.len());
        for i in 0..n {
            if let Some(sub_req) = self.subs[i].req.first() {
                self.req[i].reply = sub_req.reply.clone();
            }
        }
    }
}

/// Allocate `n` pooled Messages, optionally reserving `cap` backing slots.
pub fn get_msgs(n: usize) -> Vec<Message> {
    let mut pool = msg_pool().lock();
    (0..n)
        .map(|_| pool.pop().unwrap_or_default())
        .collect()
}

/// Return Messages (and their pooled Requests/sub-Messages) to the pool.
pub fn put_msgs(msgs: Vec<Message>) {
    let mut pool = msg_pool().lock();
    for mut m in msgs {
        m.clear();
        pool.push(m);
    }
}

fn msg_pool() -> &'static Mutex<Vec<Message>> {
    static POOL: std::sync::OnceLock<Mutex<Vec<Message>>> = std::sync::OnceLock::new();
    POOL.get_or_init(|| Mutex::new(Vec::new()))
}

/// Split one decoded client command into its per-key sub-requests,
/// assigning each the merge mode its command family uses. `cmd`/`first` is
/// the freshly decoded top-level Resp (still owned by the caller's scratch
/// Request).
pub fn split_command(msg: &mut Message, decoded: &mut Resp) -> Result<()> {
    if decoded.array_size < 1 {
        let r = msg.next_req_slot();
        r.merge_type = MergeType::No;
        r.resp.copy_from(decoded);
        return Ok(());
    }
    decoded.array_mut()[0].data.make_ascii_uppercase();
    let upper = decoded.array()[0].data.clone();

    if is_mset(&upper) {
        if decoded.array_size < 3 || decoded.array_size % 2 == 0 {
            return Err(ProxyError::BadRequest);
        }
        let mid = decoded.array_size / 2;
        for i in 0..mid {
            let r = msg.next_req_slot();
            r.merge_type = MergeType::Ok;
            build_two_key_value(&mut r.resp, CMD_MSET, &decoded.array()[i * 2 + 1], &decoded.array()[i * 2 + 2]);
        }
    } else if is_mget(&upper) {
        if decoded.array_size < 2 {
            return Err(ProxyError::BadRequest);
        }
        for i in 1..decoded.array_size {
            let r = msg.next_req_slot();
            r.merge_type = MergeType::Join;
            build_key_only(&mut r.resp, b"GET", &decoded.array()[i]);
        }
    } else if is_del_or_exists(&upper) {
        if decoded.array_size < 2 {
            return Err(ProxyError::BadRequest);
        }
        let cmd = if upper.eq_ignore_ascii_case(CMD_DEL) { CMD_DEL } else { CMD_EXISTS };
        for i in 1..decoded.array_size {
            let r = msg.next_req_slot();
            r.merge_type = MergeType::Count;
            build_key_only(&mut r.resp, cmd, &decoded.array()[i]);
        }
    } else {
        let r = msg.next_req_slot();
        r.merge_type = MergeType::No;
        r.resp.copy_from(decoded);
    }
    Ok(())
}

fn build_key_only(out: &mut Resp, cmd: &[u8], key: &Resp) {
    out.reset();
    out.resp_type = RESP_ARRAY;
    out.data = b"2".to_vec();
    let c = out_next(out);
    c.resp_type = RESP_BULK;
    c.data = cmd.to_vec();
    let k = out_next(out);
    k.copy_from(key);
}

fn build_two_key_value(out: &mut Resp, cmd: &[u8], key: &Resp, value: &Resp) {
    out.reset();
    out.resp_type = RESP_ARRAY;
    out.data = b"3".to_vec();
    let c = out_next(out);
    c.resp_type = RESP_BULK;
    c.data = cmd.to_vec();
    let k = out_next(out);
    k.copy_from(key);
    let v = out_next(out);
    v.copy_from(value);
}

fn out_next(out: &mut Resp) -> &mut Resp {
    if out.array_size < out.array.len() {
        let i = out.array_size;
        out.array[i].reset();
    } else {
        out.array.push(Resp::new());
    }
    out.array_size += 1;
    let i = out.array_size - 1;
    &mut out.array[i]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bufio::Reader;
    use crate::buffer;
    use std::io::Cursor;

    fn decode(input: &[u8]) -> Resp {
        let mut r = Reader::new(Cursor::new(input.to_vec()), buffer::get(256));
        r.read().unwrap();
        let mut resp = Resp::new();
        resp.decode(&mut r).unwrap();
        resp
    }

    #[test]
    fn mget_splits_into_get_per_key_with_join_merge() {
        let mut decoded = decode(b"*3\r\n$4\r\nMGET\r\n$1\r\na\r\n$1\r\nb\r\n");
        let mut msg = Message::new();
        split_command(&mut msg, &mut decoded).unwrap();
        assert_eq!(msg.requests().len(), 2);
        assert_eq!(msg.requests()[0].cmd(), b"GET");
        assert_eq!(msg.requests()[0].key(), b"a");
        assert_eq!(msg.requests()[0].merge_type, MergeType::Join);
        assert_eq!(msg.requests()[1].key(), b"b");
    }

    #[test]
    fn mset_requires_odd_arity() {
        let mut decoded = decode(b"*4\r\n$4\r\nMSET\r\n$1\r\na\r\n$1\r\nb\r\n$1\r\nc\r\n");
        let mut msg = Message::new();
        assert!(matches!(split_command(&mut msg, &mut decoded), Err(ProxyError::BadRequest)));
    }

    #[test]
    fn del_splits_with_count_merge() {
        let mut decoded = decode(b"*3\r\n$3\r\nDEL\r\n$1\r\na\r\n$1\r\nb\r\n");
        let mut msg = Message::new();
        split_command(&mut msg, &mut decoded).unwrap();
        assert_eq!(msg.requests().len(), 2);
        assert_eq!(msg.requests()[0].cmd(), b"DEL");
        assert_eq!(msg.requests()[0].merge_type, MergeType::Count);
    }

    #[test]
    fn wait_group_releases_handler_once_all_done() {
        let wg = WaitGroup::new();
        wg.add(2);
        let wg2 = Arc::clone(&wg);
        let t = std::thread::spawn(move || {
            wg2.done();
            wg2.done();
        });
        wg.wait();
        t.join().unwrap();
    }
}
