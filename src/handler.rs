/*!
 * Client Handler
 *
 * Per-connection decode -> cmd-check -> forward -> wait -> encode -> flush
 * loop. Message slices start small and double up to `MAX_CONCURRENT` as a
 * connection proves it pipelines more, so a bursty client doesn't pay for a
 * fully preallocated batch on its very first command. Mirrors the reference
 * handler's `allocMaxConcurrent` and the `proxyConn` `CmdCheck`/`Encode`
 * pair.
 *
 * Every leading command of every decoded message in a batch goes through
 * `cmd_check` (not just the batch's first), so a pipelined `AUTH foo\r\nGET
 * bar\r\n` can't slip `GET` through before authentication completes.
 *
 * `encode_reply` checks a message's own `err()` before looking at its
 * per-request replies: a routing or backend failure attached by the
 * forwarder or a node pipe always wins and is written as a single
 * `-<text>\r\n`, matching `pc.resp`'s error-write-then-return in the
 * reference `proxyConn`.
 */

use crate::buffer;
use crate::bufio::{Reader, Writer};
use crate::conn::Conn;
use crate::error::{ProxyError, Result};
use crate::forwarder::Forwarder;
use crate::message::{
    self, get_msgs, put_msgs, split_command, Message, MergeType, WaitGroup, CMD_AUTH, CMD_COMMAND, CMD_PING, CMD_QUIT,
};
use crate::resp::{Resp, RESP_ARRAY, RESP_ERROR, RESP_INT, RESP_STRING};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

const INITIAL_CONCURRENT: usize = 2;
const MAX_CONCURRENT: usize = 1024;

struct AuthState {
    password: Option<String>,
    authenticated: bool,
}

enum CmdOutcome {
    Forward,
    Handled(Resp),
    Quit,
}

fn simple(resp_type: u8, data: &[u8]) -> Resp {
    let mut r = Resp::new();
    r.resp_type = resp_type;
    r.data = data.to_vec();
    r
}

fn cmd_check(cmd: &[u8], arg1: Option<&[u8]>, auth: &mut AuthState) -> CmdOutcome {
    if !message::is_supported_command(cmd) && !message::is_special_command(cmd) {
        return CmdOutcome::Handled(simple(RESP_ERROR, b"ERR unknown command"));
    }
    if !auth.authenticated && !message::is_special_command(cmd) {
        return CmdOutcome::Handled(simple(RESP_ERROR, b"NOAUTH Authentication required."));
    }
    if cmd.eq_ignore_ascii_case(CMD_AUTH) {
        let ok = match (&auth.password, arg1) {
            (Some(p), Some(given)) => p.as_bytes() == given,
            (None, _) => true,
            (Some(_), None) => false,
        };
        return if ok {
            auth.authenticated = true;
            CmdOutcome::Handled(simple(RESP_STRING, b"OK"))
        } else {
            CmdOutcome::Handled(simple(RESP_ERROR, b"ERR invalid password"))
        };
    }
    if cmd.eq_ignore_ascii_case(CMD_PING) {
        return CmdOutcome::Handled(simple(RESP_STRING, b"PONG"));
    }
    if cmd.eq_ignore_ascii_case(CMD_QUIT) {
        return CmdOutcome::Quit;
    }
    if cmd.eq_ignore_ascii_case(CMD_COMMAND) {
        return CmdOutcome::Handled(simple(RESP_INT, b"-1"));
    }
    CmdOutcome::Forward
}

/// Decode the next command into `top`. Blocks for more socket data only when
/// `must_block` (there's nothing decoded yet for this round); otherwise a
/// `BufferFull` just means "nothing more is buffered right now" and returns
/// `Ok(false)` so the handler can forward what it already has.
fn decode_available<R: std::io::Read>(br: &mut Reader<R>, top: &mut Resp, must_block: bool) -> Result<bool> {
    loop {
        match top.decode(br) {
            Ok(()) => return Ok(true),
            Err(ProxyError::BufferFull) => {
                if must_block {
                    br.read()?;
                    continue;
                }
                return Ok(false);
            }
            Err(e) => return Err(e),
        }
    }
}

fn encode_reply<W: std::io::Write>(msg: &Message, bw: &mut Writer<W>) -> Result<()> {
    if let Some(err) = msg.err() {
        return simple(RESP_ERROR, err.to_string().as_bytes()).encode(bw);
    }
    let reqs = msg.requests();
    if reqs.is_empty() {
        return Ok(());
    }
    if reqs.len() == 1 {
        return reqs[0].reply.encode(bw);
    }
    match reqs[0].merge_type {
        MergeType::Ok => {
            if let Some(err_reply) = reqs.iter().find(|r| r.reply.resp_type == RESP_ERROR) {
                return err_reply.reply.encode(bw);
            }
            simple(RESP_STRING, b"OK").encode(bw)
        }
        MergeType::Join => {
            let mut arr = Resp::new();
            arr.resp_type = RESP_ARRAY;
            arr.data = reqs.len().to_string().into_bytes();
            for r in reqs {
                arr.array.push(r.reply.clone());
                arr.array_size += 1;
            }
            arr.encode(bw)
        }
        MergeType::Count => {
            let mut total: i64 = 0;
            for r in reqs {
                if r.reply.resp_type == RESP_ERROR {
                    return r.reply.encode(bw);
                }
                let n: i64 = std::str::from_utf8(&r.reply.data)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or(ProxyError::BadCount)?;
                total += n;
            }
            simple(RESP_INT, total.to_string().as_bytes()).encode(bw)
        }
        MergeType::No => reqs[0].reply.encode(bw),
    }
}

/// Drives one accepted client connection end to end.
pub struct Handler {
    forwarder: Arc<Forwarder>,
    password: Option<String>,
    conns: Arc<AtomicI64>,
}

impl Handler {
    pub fn new(forwarder: Arc<Forwarder>, password: Option<String>, conns: Arc<AtomicI64>) -> Self {
        Handler {
            forwarder,
            password,
            conns,
        }
    }

    /// Run the handler loop to completion, logging unexpected errors. A
    /// client-initiated `QUIT` is not logged: it is the expected way to end
    /// a session.
    pub fn handle(&self, conn: Conn) {
        let peer = conn.addr().to_string();
        match self.run(conn) {
            Ok(()) | Err(ProxyError::Quit) => {}
            Err(e) => log::warn!("client {peer}: {e}"),
        }
        self.conns.fetch_sub(1, Ordering::Relaxed);
    }

    fn run(&self, conn: Conn) -> Result<()> {
        let mut reader = Reader::new(conn, buffer::get(4096));
        let mut concurrent = INITIAL_CONCURRENT;
        let mut auth = AuthState {
            password: self.password.clone(),
            authenticated: self.password.is_none(),
        };

        loop {
            let mut msgs = get_msgs(concurrent);
            let wg = WaitGroup::new();
            let mut decoded = 0usize;
            let mut quit = false;

            for msg in msgs.iter_mut() {
                msg.reset();
                msg.with_wait_group(Arc::clone(&wg));
                let mut top = Resp::new();
                match decode_available(&mut reader, &mut top, decoded == 0) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        put_msgs(msgs);
                        return Err(e);
                    }
                }

                let cmd = top.array().first().map(|r| r.data.as_slice()).unwrap_or(&[]);
                let arg1 = top.array().get(1).map(|r| r.data.as_slice());
                match cmd_check(cmd, arg1, &mut auth) {
                    CmdOutcome::Forward => {
                        if let Err(e) = split_command(msg, &mut top) {
                            let r = msg.next_req_slot();
                            r.resp.copy_from(&top);
                            r.reply = simple(RESP_ERROR, format!("ERR {e}").as_bytes());
                        }
                    }
                    CmdOutcome::Handled(reply) => {
                        let r = msg.next_req_slot();
                        r.resp.copy_from(&top);
                        r.reply = reply;
                    }
                    CmdOutcome::Quit => {
                        let r = msg.next_req_slot();
                        r.resp.copy_from(&top);
                        r.reply = simple(RESP_STRING, b"OK");
                        decoded += 1;
                        quit = true;
                        break;
                    }
                }
                decoded += 1;
            }

            if decoded == 0 {
                put_msgs(msgs);
                continue;
            }
            msgs.truncate(decoded);

            self.forwarder.forward(&mut msgs);
            wg.wait();

            for msg in msgs.iter_mut() {
                msg.sync_subs();
            }

            {
                let mut bw = Writer::new(reader.get_mut());
                for msg in msgs.iter() {
                    encode_reply(msg, &mut bw)?;
                }
                bw.flush()?;
            }

            put_msgs(msgs);

            if quit {
                return Err(ProxyError::Quit);
            }
            if concurrent < MAX_CONCURRENT && decoded == concurrent {
                concurrent = (concurrent * 2).min(MAX_CONCURRENT);
            }
        }
    }
}
