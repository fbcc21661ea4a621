//! The application API driven as a real client would: handshake on the
//! control port, then register, bind, send, and receive over the session
//! socket.

use std::time::Duration;

use tokio::net::UdpSocket;

use petrel_daemon::api::{dopts, status, typecode};
use petrel_daemon::bootstrap::bootstrap;
use petrel_daemon::config::DaemonConfig;
use petrel_daemon::xdr::{XdrReader, XdrWriter};

struct ApiClient {
    socket: UdpSocket,
}

impl ApiClient {
    async fn open(control_port: u16) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        socket
            .send_to(&typecode::DTN_OPEN.to_be_bytes(), ("127.0.0.1", control_port))
            .await
            .expect("handshake send");

        let mut buf = [0u8; 16];
        let (n, session_addr) =
            tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
                .await
                .expect("handshake reply in time")
                .expect("handshake recv");
        assert_eq!(n, 4);
        assert_eq!(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]), typecode::DTN_OPEN);
        socket.connect(session_addr).await.expect("connect session");
        Self { socket }
    }

    async fn call(&self, code: u32, args: &[u8]) -> Vec<u8> {
        let mut msg = code.to_be_bytes().to_vec();
        msg.extend_from_slice(args);
        self.socket.send(&msg).await.expect("send");
        let mut buf = vec![0u8; 65536];
        let n = tokio::time::timeout(Duration::from_secs(3), self.socket.recv(&mut buf))
            .await
            .expect("reply in time")
            .expect("recv");
        buf.truncate(n);
        buf
    }
}

#[tokio::test]
async fn register_send_receive_loopback() {
    let mut config = DaemonConfig::from_toml("local_eid = \"dtn://apinode\"").expect("config");
    config.api.port = Some(0);
    let runtime = bootstrap(config).await.expect("bootstrap");
    let client = ApiClient::open(runtime.api_port).await;

    // GETINFO reports the node's EID.
    let reply = client.call(typecode::DTN_GETINFO, &[]).await;
    let mut r = XdrReader::new(&reply);
    assert_eq!(r.u32().expect("status"), status::SUCCESS);
    assert_eq!(r.string().expect("eid"), "dtn://apinode");

    // REGISTER an application endpoint.
    let args = XdrWriter::new()
        .string("dtn://apinode/app")
        .u32(0) // defer
        .u32(0) // no expiration
        .string("")
        .finish();
    let reply = client.call(typecode::DTN_REGISTER, &args).await;
    let mut r = XdrReader::new(&reply);
    assert_eq!(r.u32().expect("status"), status::SUCCESS);
    let regid = r.u32().expect("regid");

    // BIND the session to it; a second bind must be refused.
    let args = XdrWriter::new().u32(regid).finish();
    let reply = client.call(typecode::DTN_BIND, &args).await;
    assert_eq!(XdrReader::new(&reply).u32().expect("status"), status::SUCCESS);
    let reply = client.call(typecode::DTN_BIND, &args).await;
    assert_eq!(XdrReader::new(&reply).u32().expect("status"), status::POLICY);

    // SEND to ourselves.
    let args = XdrWriter::new()
        .string("dtn://apinode/app")
        .string("dtn://apinode/app")
        .u32(dopts::DELIVERY_RCPT)
        .u32(300)
        .u32(0) // payload in message
        .opaque(b"hello")
        .finish();
    let reply = client.call(typecode::DTN_SEND, &args).await;
    assert_eq!(XdrReader::new(&reply).u32().expect("status"), status::SUCCESS);

    // RECV the loopback delivery.
    let args = XdrWriter::new().u32(2000).finish();
    let reply = client.call(typecode::DTN_RECV, &args).await;
    let mut r = XdrReader::new(&reply);
    assert_eq!(r.u32().expect("status"), status::SUCCESS);
    assert_eq!(r.string().expect("source"), "dtn://apinode/app");
    let _secs = r.u64().expect("secs");
    let _seq = r.u64().expect("seq");
    assert_eq!(r.opaque().expect("payload"), b"hello");

    // RECV again times out cleanly.
    let args = XdrWriter::new().u32(100).finish();
    let reply = client.call(typecode::DTN_RECV, &args).await;
    assert_eq!(XdrReader::new(&reply).u32().expect("status"), status::TIMEOUT);

    let reply = client.call(typecode::DTN_CLOSE, &[]).await;
    assert_eq!(XdrReader::new(&reply).u32().expect("status"), status::SUCCESS);

    runtime.handle.shutdown();
}

#[tokio::test]
async fn send_payload_from_file() {
    let mut config = DaemonConfig::from_toml("local_eid = \"dtn://filenode\"").expect("config");
    config.api.port = Some(0);
    let runtime = bootstrap(config).await.expect("bootstrap");
    let client = ApiClient::open(runtime.api_port).await;

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("payload.bin");
    std::fs::write(&path, b"file payload bytes").expect("write");

    let args = XdrWriter::new()
        .string("dtn://filenode/app")
        .u32(0)
        .u32(0)
        .string("")
        .finish();
    let reply = client.call(typecode::DTN_REGISTER, &args).await;
    let mut r = XdrReader::new(&reply);
    assert_eq!(r.u32().expect("status"), status::SUCCESS);
    let regid = r.u32().expect("regid");
    let reply = client.call(typecode::DTN_BIND, &XdrWriter::new().u32(regid).finish()).await;
    assert_eq!(XdrReader::new(&reply).u32().expect("status"), status::SUCCESS);

    let args = XdrWriter::new()
        .string("dtn://filenode/app")
        .string("dtn://filenode/app")
        .u32(0)
        .u32(300)
        .u32(1) // payload in file
        .opaque(path.to_string_lossy().as_bytes())
        .finish();
    let reply = client.call(typecode::DTN_SEND, &args).await;
    assert_eq!(XdrReader::new(&reply).u32().expect("status"), status::SUCCESS);

    let reply = client.call(typecode::DTN_RECV, &XdrWriter::new().u32(2000).finish()).await;
    let mut r = XdrReader::new(&reply);
    assert_eq!(r.u32().expect("status"), status::SUCCESS);
    let _source = r.string().expect("source");
    let _secs = r.u64().expect("secs");
    let _seq = r.u64().expect("seq");
    assert_eq!(r.opaque().expect("payload"), b"file payload bytes");

    runtime.handle.shutdown();
}
