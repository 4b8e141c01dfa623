/*!
 * Node Connection Pipeline
 *
 * `NodeConnPipe` fans a node's traffic out across `conns` backend TCP
 * connections, each driven by its own worker thread: drain up to
 * `PIPE_MAX_COUNT` queued requests non-blockingly, write them as one batch,
 * then read back exactly that many replies in order before taking the next
 * batch. Requests for the same node are sharded across connections by CRC16
 * of the key so unrelated keys pipeline independently, while traffic for the
 * same key always lands on the same connection and keeps its ordering.
 *
 * Mirrors the reference `NodeConnPipe`/`msgPipe`, down to the "block for one
 * message, then drain the rest non-blockingly" loop that avoids busy-waiting
 * an idle node.
 */

use crate::buffer;
use crate::bufio::{Reader, Writer};
use crate::conn::Conn;
use crate::error::{ProxyError, Result};
use crate::hashkit::crc16;
use crate::message::Message;
use crossbeam::channel::{bounded, Receiver, Sender, TryRecvError};
use smol_str::SmolStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const PIPE_MAX_COUNT: usize = 32;
const PIPE_DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// A raw pointer to a `Message` owned by the client handler thread, handed
/// to a pipe worker thread. Sound under one invariant: the handler must not
/// touch the message again until its `WaitGroup` can reach zero, which it
/// enforces by calling `wg.wait()` before reuse — the same happens-before
/// edge the reference implementation gets for free by sharing a pointer
/// across goroutines guarded only by a `sync.WaitGroup`.
struct MsgPtr(*mut Message);
unsafe impl Send for MsgPtr {}

pub struct NodeConnPipe {
    addr: SmolStr,
    senders: Vec<Sender<MsgPtr>>,
    closed: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl NodeConnPipe {
    pub fn new(addr: &str, conns: usize, read_timeout: Duration, write_timeout: Duration) -> Self {
        let conns = conns.max(1);
        let closed = Arc::new(AtomicBool::new(false));
        let mut senders = Vec::with_capacity(conns);
        let mut handles = Vec::with_capacity(conns);
        for _ in 0..conns {
            let (tx, rx) = bounded::<MsgPtr>(PIPE_MAX_COUNT * PIPE_MAX_COUNT);
            let addr_owned = addr.to_string();
            let closed_flag = Arc::clone(&closed);
            let handle = std::thread::Builder::new()
                .name(format!("ferrule-pipe-{addr}"))
                .spawn(move || pipe_loop(addr_owned, rx, closed_flag, read_timeout, write_timeout))
                .expect("spawn backend pipe worker thread");
            senders.push(tx);
            handles.push(handle);
        }
        NodeConnPipe {
            addr: SmolStr::new(addr),
            senders,
            closed,
            handles,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Enqueue one already-split, single-request `Message` for this node.
    /// `msg` must outlive the round trip: the handler calls this only after
    /// `msg.add()`-ing it to a `WaitGroup` it will subsequently `wait()` on.
    pub fn push(&self, msg: &mut Message) {
        msg.add();
        msg.mark_addr(&self.addr);
        if self.closed.load(Ordering::Acquire) {
            msg.with_error(Some(ProxyError::ForwarderClosed));
            msg.done();
            return;
        }
        let shard = if self.senders.len() == 1 {
            0
        } else {
            let key = msg.request().map(|r| r.key()).unwrap_or(&[]);
            crc16(key) as usize % self.senders.len()
        };
        let ptr = MsgPtr(msg as *mut Message);
        if self.senders[shard].try_send(ptr).is_err() {
            msg.with_error(Some(ProxyError::PipeChanFull));
            msg.done();
        }
    }

    /// Stop taking new work and wait for in-flight batches to drain.
    pub fn close(&mut self) {
        self.closed.store(true, Ordering::Release);
        self.senders.clear();
        for h in self.handles.drain(..) {
            let _ = h.join();
        }
    }
}

impl Drop for NodeConnPipe {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}

fn pipe_loop(addr: String, rx: Receiver<MsgPtr>, closed: Arc<AtomicBool>, read_timeout: Duration, write_timeout: Duration) {
    let mut reader: Option<Reader<Conn>> = None;
    let mut batch: Vec<MsgPtr> = Vec::with_capacity(PIPE_MAX_COUNT);

    loop {
        batch.clear();
        let first = match rx.recv() {
            Ok(m) => m,
            Err(_) => return,
        };
        batch.push(first);
        while batch.len() < PIPE_MAX_COUNT {
            match rx.try_recv() {
                Ok(m) => batch.push(m),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        if reader.is_none() {
            match Conn::dial(&addr, PIPE_DIAL_TIMEOUT, read_timeout, write_timeout) {
                Ok(c) => reader = Some(Reader::new(c, buffer::get(4096))),
                Err(e) => {
                    log::warn!("pipe {addr}: dial failed: {e}");
                    fail_batch(&batch, ProxyError::Io(e.to_string()));
                    continue;
                }
            }
        }
        let r = reader.as_mut().expect("just ensured reader is set");

        if let Err(e) = write_batch(r.get_mut(), &batch) {
            log::warn!("pipe {addr}: write failed: {e}");
            reader = None;
            fail_batch(&batch, e);
            continue;
        }

        if read_batch(r, &batch).is_err() {
            log::warn!("pipe {addr}: read failed, reconnecting");
            reader = None;
            continue;
        }

        if closed.load(Ordering::Acquire) && rx.is_empty() {
            return;
        }
    }
}

fn write_batch<W: std::io::Write>(conn: W, batch: &[MsgPtr]) -> Result<()> {
    let mut bw = Writer::new(conn);
    for ptr in batch {
        let msg = unsafe { &mut *ptr.0 };
        msg.mark_write();
        if let Some(req) = msg.request() {
            req.resp.encode(&mut bw)?;
        }
    }
    bw.flush()
}

fn read_batch(r: &mut Reader<Conn>, batch: &[MsgPtr]) -> Result<()> {
    for (i, ptr) in batch.iter().enumerate() {
        let msg = unsafe { &mut *ptr.0 };
        let result = match msg.request_mut() {
            Some(req) => decode_reply(r, &mut req.reply),
            None => Ok(()),
        };
        match result {
            Ok(()) => {
                msg.mark_read();
                msg.mark_end();
                msg.done();
            }
            Err(e) => {
                msg.with_error(Some(e.clone()));
                msg.mark_end();
                msg.done();
                fail_batch(&batch[i + 1..], e.clone());
                return Err(e);
            }
        }
    }
    Ok(())
}

fn decode_reply<R: std::io::Read>(br: &mut Reader<R>, out: &mut crate::resp::Resp) -> Result<()> {
    loop {
        match out.decode(br) {
            Ok(()) => return Ok(()),
            Err(ProxyError::BufferFull) => br.read()?,
            Err(e) => return Err(e),
        }
    }
}

fn fail_batch(batch: &[MsgPtr], err: ProxyError) {
    for ptr in batch {
        let msg = unsafe { &mut *ptr.0 };
        msg.with_error(Some(err.clone()));
        msg.mark_end();
        msg.done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{get_msgs, Request};
    use crate::resp::Resp;
    use std::io::{Cursor, Read, Write};
    use std::net::{TcpListener, TcpStream};

    /// A minimal server loop standing in for a backend node: echoes back a
    /// fixed `+OK\r\n` for every request it reads, once per accepted batch.
    fn spawn_echo_server() -> (String, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => return,
                        Ok(_) => {
                            let _ = stream.write_all(b"+OK\r\n");
                        }
                    }
                }
            }
        });
        (addr, handle)
    }

    #[test]
    fn push_round_trips_a_single_request_through_a_real_socket() {
        let (addr, _server) = spawn_echo_server();
        let pipe = NodeConnPipe::new(&addr, 1, Duration::from_secs(2), Duration::from_secs(2));

        let mut msgs = get_msgs(1);
        let msg = &mut msgs[0];
        let wg = crate::message::WaitGroup::new();
        msg.with_wait_group(wg.clone());
        let mut req = Request::default();
        let mut r = Reader::new(Cursor::new(b"*1\r\n$4\r\nPING\r\n".to_vec()), buffer::get(64));
        r.read().unwrap();
        req.resp.decode(&mut r).unwrap();
        msg.with_request(req);

        pipe.push(msg);
        wg.wait();

        assert!(msg.err().is_none());
        assert_eq!(msg.request().unwrap().reply.resp_type, crate::resp::RESP_STRING);
        assert_eq!(msg.request().unwrap().reply.data, b"OK");
        let _ = Resp::new();
    }
}
