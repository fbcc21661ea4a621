//! Application API: a UDP control socket accepting `DTN_OPEN` handshakes,
//! then one UDP session socket per client carrying XDR-framed requests.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use petrel_bp::payload::BundlePayload;
use petrel_bp::{Bundle, BundleRef, EndpointId};
use petrel_node::daemon::DaemonHandle;
use petrel_node::event::{BundleEvent, EventSource};
use petrel_node::reg::{FailureAction, Registration, RegistrationTable};
use petrel_node::NodeError;

use crate::xdr::{XdrReader, XdrWriter};

/// Request typecodes.
pub mod typecode {
    pub const DTN_OPEN: u32 = 1;
    pub const DTN_GETINFO: u32 = 2;
    pub const DTN_REGISTER: u32 = 3;
    pub const DTN_BIND: u32 = 4;
    pub const DTN_SEND: u32 = 5;
    pub const DTN_RECV: u32 = 6;
    pub const DTN_CLOSE: u32 = 7;
}

/// Reply status codes.
pub mod status {
    pub const SUCCESS: u32 = 0;
    pub const INVAL: u32 = 1;
    pub const POLICY: u32 = 2;
    pub const TIMEOUT: u32 = 3;
    pub const INTERNAL: u32 = 4;
}

/// Delivery-option bits accepted on DTN_SEND.
pub mod dopts {
    pub const CUSTODY: u32 = 1 << 0;
    pub const RECEIVE_RCPT: u32 = 1 << 1;
    pub const FORWARD_RCPT: u32 = 1 << 2;
    pub const DELIVERY_RCPT: u32 = 1 << 3;
    pub const DELETION_RCPT: u32 = 1 << 4;
    pub const DO_NOT_FRAGMENT: u32 = 1 << 5;
}

const MAX_REQUEST: usize = 65_507;

#[derive(Clone)]
pub struct ApiContext {
    pub daemon: DaemonHandle,
    pub regs: Arc<Mutex<RegistrationTable>>,
    pub local_eid: EndpointId,
}

impl ApiContext {
    fn lock_regs(&self) -> std::sync::MutexGuard<'_, RegistrationTable> {
        self.regs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Start the control listener, returning the bound port. Each `DTN_OPEN`
/// spawns a session actor on its own socket; the handshake reply arrives
/// from the session port.
pub async fn start(addr: &str, port: u16, ctx: ApiContext) -> Result<u16, NodeError> {
    let control = UdpSocket::bind((addr, port)).await?;
    let bound_port = control.local_addr()?.port();
    log::info!("api: control listener on {}:{}", addr, bound_port);
    let bind_addr = addr.to_string();
    let cancel = ctx.daemon.cancel_token();

    tokio::spawn(async move {
        let mut buf = [0u8; 64];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = control.recv_from(&mut buf) => match result {
                    Ok((n, client)) => {
                        let code = (n >= 4)
                            .then(|| u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]));
                        if code == Some(typecode::DTN_OPEN) {
                            if let Err(e) = open_session(&bind_addr, client, ctx.clone()).await {
                                log::warn!("api: session open for {client} failed: {e}");
                            }
                        } else {
                            log::debug!("api: stray datagram on control port from {client}");
                        }
                    }
                    Err(e) => {
                        log::warn!("api: control recv: {e}");
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
            }
        }
    });
    Ok(bound_port)
}

async fn open_session(
    bind_addr: &str,
    client: SocketAddr,
    ctx: ApiContext,
) -> Result<(), NodeError> {
    let socket = UdpSocket::bind((bind_addr, 0)).await?;
    socket.connect(client).await?;
    socket.send(&typecode::DTN_OPEN.to_be_bytes()).await?;
    log::debug!("api: session for {} on {}", client, socket.local_addr()?);

    tokio::spawn(session_loop(socket, ctx));
    Ok(())
}

struct SessionState {
    regid: Option<u32>,
    delivery_rx: Option<mpsc::UnboundedReceiver<BundleRef>>,
}

async fn session_loop(socket: UdpSocket, ctx: ApiContext) {
    let cancel = ctx.daemon.cancel_token();
    let mut state = SessionState { regid: None, delivery_rx: None };
    let mut buf = vec![0u8; MAX_REQUEST];

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv(&mut buf) => match result {
                Ok(n) => n,
                Err(e) => {
                    log::debug!("api: session closed: {e}");
                    break;
                }
            },
        };
        if n < 4 {
            continue;
        }
        let code = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let mut args = XdrReader::new(&buf[4..n]);

        let (reply, done) = match code {
            typecode::DTN_GETINFO => (getinfo(&ctx), false),
            typecode::DTN_REGISTER => (register(&ctx, &mut args), false),
            typecode::DTN_BIND => (bind(&ctx, &mut state, &mut args), false),
            typecode::DTN_SEND => (send(&ctx, &mut args), false),
            typecode::DTN_RECV => (recv(&mut state, &mut args).await, false),
            typecode::DTN_CLOSE => (close(&ctx, &mut state), true),
            other => {
                log::debug!("api: unknown typecode {other}");
                (error_reply(status::INVAL), false)
            }
        };
        if let Err(e) = socket.send(&reply).await {
            log::debug!("api: session reply failed: {e}");
            break;
        }
        if done {
            break;
        }
    }

    // A vanished client must not hold its registration bound.
    close(&ctx, &mut state);
}

fn error_reply(code: u32) -> Vec<u8> {
    XdrWriter::new().u32(code).finish()
}

fn getinfo(ctx: &ApiContext) -> Vec<u8> {
    XdrWriter::new()
        .u32(status::SUCCESS)
        .string(&ctx.local_eid.to_string())
        .finish()
}

fn register(ctx: &ApiContext, args: &mut XdrReader<'_>) -> Vec<u8> {
    let parsed = (|| -> Result<(String, u32, u32, String), crate::xdr::XdrError> {
        Ok((args.string()?, args.u32()?, args.u32()?, args.string()?))
    })();
    let Ok((endpoint, action, expiration, script)) = parsed else {
        return error_reply(status::INVAL);
    };
    let Ok(endpoint) = EndpointId::parse(&endpoint) else {
        return error_reply(status::INVAL);
    };
    let action = match action {
        0 => FailureAction::Defer,
        1 => FailureAction::Abort,
        2 => FailureAction::Exec,
        _ => return error_reply(status::INVAL),
    };
    let script = (!script.is_empty()).then_some(script);

    let mut regs = ctx.lock_regs();
    let regid = regs.next_regid();
    let reg = Registration::new(regid, endpoint, action, expiration as u64, script);
    if let Err(e) = regs.add(reg) {
        log::warn!("api: register failed: {e}");
        return error_reply(status::INTERNAL);
    }
    drop(regs);
    ctx.daemon.post(BundleEvent::RegistrationAdded { regid });
    XdrWriter::new().u32(status::SUCCESS).u32(regid).finish()
}

fn bind(ctx: &ApiContext, state: &mut SessionState, args: &mut XdrReader<'_>) -> Vec<u8> {
    let Ok(regid) = args.u32() else {
        return error_reply(status::INVAL);
    };
    if state.regid.is_some() {
        return error_reply(status::POLICY);
    }
    let Some(reg) = ctx.lock_regs().get(regid) else {
        return error_reply(status::INVAL);
    };
    let (tx, rx) = mpsc::unbounded_channel();
    if let Err(e) = reg.bind(tx) {
        log::debug!("api: bind {regid}: {e}");
        return error_reply(status::POLICY);
    }
    state.regid = Some(regid);
    state.delivery_rx = Some(rx);
    XdrWriter::new().u32(status::SUCCESS).finish()
}

fn send(ctx: &ApiContext, args: &mut XdrReader<'_>) -> Vec<u8> {
    let parsed = (|| -> Result<(String, String, u32, u32, u32, Vec<u8>), crate::xdr::XdrError> {
        let source = args.string()?;
        let dest = args.string()?;
        let opts = args.u32()?;
        let lifetime = args.u32()?;
        let location = args.u32()?;
        let payload = args.opaque()?;
        Ok((source, dest, opts, lifetime, location, payload))
    })();
    let Ok((source, dest, opts, lifetime, location, payload)) = parsed else {
        return error_reply(status::INVAL);
    };
    let (Ok(dest), Ok(source)) = (EndpointId::parse(&dest), EndpointId::parse(&source)) else {
        return error_reply(status::INVAL);
    };

    // Location 1 names a file the daemon reads; 0 carries the bytes.
    let payload = match location {
        0 => payload,
        1 => {
            let Ok(path) = String::from_utf8(payload) else {
                return error_reply(status::INVAL);
            };
            match std::fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::warn!("api: payload file {path}: {e}");
                    return error_reply(status::INVAL);
                }
            }
        }
        _ => return error_reply(status::INVAL),
    };

    let mut bundle = Bundle::new();
    bundle.source = source;
    bundle.dest = dest;
    bundle.replyto = ctx.local_eid.clone();
    bundle.lifetime_secs = lifetime as u64;
    bundle.custody_requested = opts & dopts::CUSTODY != 0;
    bundle.receive_rcpt = opts & dopts::RECEIVE_RCPT != 0;
    bundle.forward_rcpt = opts & dopts::FORWARD_RCPT != 0;
    bundle.delivery_rcpt = opts & dopts::DELIVERY_RCPT != 0;
    bundle.deletion_rcpt = opts & dopts::DELETION_RCPT != 0;
    bundle.do_not_fragment = opts & dopts::DO_NOT_FRAGMENT != 0;
    let bytes = payload.len() as u64;
    bundle.orig_length = bytes;
    bundle.set_payload(BundlePayload::with_memory(payload));
    let ts = bundle.creation_ts;

    ctx.daemon.post(BundleEvent::BundleReceived {
        bundle: Arc::new(bundle),
        source: EventSource::App,
        bytes,
        link: None,
    });
    XdrWriter::new().u32(status::SUCCESS).u64(ts.secs).u64(ts.seqno).finish()
}

async fn recv(state: &mut SessionState, args: &mut XdrReader<'_>) -> Vec<u8> {
    let Ok(timeout_ms) = args.u32() else {
        return error_reply(status::INVAL);
    };
    let Some(rx) = state.delivery_rx.as_mut() else {
        return error_reply(status::POLICY);
    };
    let bundle = tokio::time::timeout(Duration::from_millis(timeout_ms as u64), rx.recv()).await;
    match bundle {
        Ok(Some(bundle)) => {
            let payload = match bundle.state().payload.read_all() {
                Ok(p) => p,
                Err(e) => {
                    log::warn!("api: payload read: {e}");
                    return error_reply(status::INTERNAL);
                }
            };
            XdrWriter::new()
                .u32(status::SUCCESS)
                .string(&bundle.source.to_string())
                .u64(bundle.creation_ts.secs)
                .u64(bundle.creation_ts.seqno)
                .opaque(&payload)
                .finish()
        }
        Ok(None) => error_reply(status::INTERNAL),
        Err(_) => error_reply(status::TIMEOUT),
    }
}

fn close(ctx: &ApiContext, state: &mut SessionState) -> Vec<u8> {
    if let Some(regid) = state.regid.take() {
        if let Some(reg) = ctx.lock_regs().get(regid) {
            reg.unbind();
        }
    }
    state.delivery_rx = None;
    XdrWriter::new().u32(status::SUCCESS).finish()
}
