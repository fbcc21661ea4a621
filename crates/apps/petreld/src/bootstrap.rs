//! Assemble a running node from configuration.

use std::sync::{Arc, Mutex};

use anyhow::{bail, Context};

use petrel_bp::{BundleProtocol, EndpointId, ProcessorRegistry};
use petrel_node::cla::ltp::bucket::BucketKind;
use petrel_node::cla::ltp::segment::SegmentAuth;
use petrel_node::cla::ltp::{LtpCla, LtpParams};
use petrel_node::cla::tcp::TcpCla;
use petrel_node::cla::udp::UdpCla;
use petrel_node::cla::{ClaRegistry, InterfaceParams};
use petrel_node::custody::CustodyManager;
use petrel_node::daemon::{BundleDaemon, DaemonHandle};
use petrel_node::event::BundleEvent;
use petrel_node::reg::RegistrationTable;
use petrel_node::router::{ForwardingMode, RouteEntry, Router, StaticRouter};
use petrel_node::storage::{BundleStore, PendingAcsStore, RegistrationStore};
use petrel_node::{ContactManager, Link, LinkParams, NodeConfig};
use petrel_security::{SecurityPolicy, StaticKeySteward};

use crate::admin::{self, AdminChannel, AdminContext};
use crate::api::{self, ApiContext};
use crate::config::DaemonConfig;

pub struct NodeRuntime {
    pub handle: DaemonHandle,
    pub contacts: Arc<Mutex<ContactManager>>,
    pub regs: Arc<Mutex<RegistrationTable>>,
    pub admin: AdminChannel,
    pub local_eid: EndpointId,
    pub api_port: u16,
    pub join: tokio::task::JoinHandle<()>,
}

fn hex32(label: &str, s: &str) -> anyhow::Result<[u8; 32]> {
    let bytes = hex::decode(s).with_context(|| format!("{label}: bad hex"))?;
    bytes.as_slice().try_into().map_err(|_| anyhow::anyhow!("{label}: need 32 bytes"))
}

fn build_steward(config: &DaemonConfig) -> anyhow::Result<Arc<StaticKeySteward>> {
    let steward = StaticKeySteward::new();
    let sec = &config.security;

    if let Some(key) = sec.ba1_key.as_deref() {
        let key = hex::decode(key).context("ba1_key: bad hex")?;
        let wildcard = EndpointId::parse("*:*").expect("wildcard eid");
        steward.set_hmac_key(&wildcard, sec.ba1_key_id.unwrap_or(0), key);
    }
    if let Some(seed) = sec.signing_key.as_deref() {
        let seed = hex32("signing_key", seed)?;
        steward.set_signing_key(ed25519_dalek::SigningKey::from_bytes(&seed));
    }
    if let Some(secret) = sec.agreement_secret.as_deref() {
        let secret = hex32("agreement_secret", secret)?;
        steward.set_agreement_secret(x25519_dalek::StaticSecret::from(secret));
    }
    for peer in &sec.verify_keys {
        let eid = EndpointId::parse(&peer.eid)
            .map_err(|e| anyhow::anyhow!("verify key eid: {e}"))?;
        let key = hex32("verify key", &peer.key)?;
        let key = ed25519_dalek::VerifyingKey::from_bytes(&key)
            .context("verify key: not a valid point")?;
        steward.set_verify_key(&eid, key);
    }
    for peer in &sec.agreement_keys {
        let eid = EndpointId::parse(&peer.eid)
            .map_err(|e| anyhow::anyhow!("agreement key eid: {e}"))?;
        let key = hex32("agreement key", &peer.key)?;
        steward.set_agreement_public(&eid, x25519_dalek::PublicKey::from(key));
    }
    Ok(Arc::new(steward))
}

fn build_ltp_params(config: &DaemonConfig) -> anyhow::Result<LtpParams> {
    let ltp = &config.ltp;
    let mut params = LtpParams::default();
    if let Some(v) = ltp.engine_id {
        params.engine_id = v;
    }
    if let Some(v) = ltp.agg_size {
        params.agg_size = v;
    }
    if let Some(v) = ltp.agg_time_ms {
        params.agg_time_ms = v;
    }
    if let Some(v) = ltp.seg_size {
        params.seg_size = v;
    }
    if let Some(v) = ltp.retran_intvl_ms {
        params.retran_intvl_ms = v;
    }
    if let Some(v) = ltp.retran_retries {
        params.retran_retries = v;
    }
    if let Some(v) = ltp.inact_intvl_ms {
        params.inact_intvl_ms = v;
    }
    if let Some(v) = ltp.green {
        params.green = v;
    }
    if let Some(v) = ltp.rate_bps {
        params.rate_bps = v;
    }
    if let Some(v) = ltp.bucket_depth_bits {
        params.bucket_depth_bits = v;
    }
    match ltp.bucket.as_deref() {
        None | Some("standard") => {}
        Some("leaky") => params.bucket_kind = BucketKind::Leaky,
        Some(other) => bail!("ltp.bucket: unknown kind {other}"),
    }
    if let Some(key) = ltp.auth_key.as_deref() {
        params.auth = Some(SegmentAuth {
            key: hex::decode(key).context("ltp.auth_key: bad hex")?,
            key_id: ltp.auth_key_id.unwrap_or(0),
        });
    }
    Ok(params)
}

pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<NodeRuntime> {
    let local_eid = EndpointId::parse(&config.local_eid)
        .map_err(|e| anyhow::anyhow!("local_eid: {e}"))?;

    // Security processors and policy.
    let steward = build_steward(&config)?;
    let policy = SecurityPolicy {
        ba1: config.security.ba1,
        pi2: config.security.pi2,
        pc3: config.security.pc3,
        es4: config.security.es4,
        ba1_key_id: config.security.ba1_key_id.unwrap_or(0),
    };
    let mut registry = ProcessorRegistry::new();
    petrel_security::register(&mut registry, steward.clone(), policy);
    let protocol = BundleProtocol::new(Arc::new(registry));

    // Durable stores.
    let (bundle_store, reg_store, acs_store) = match config.db_dir.as_ref() {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create {}", dir.display()))?;
            (
                Some(BundleStore::open(&dir.join("bundles.db")).context("bundle store")?),
                Some(
                    RegistrationStore::open(&dir.join("registrations.db"))
                        .context("registration store")?,
                ),
                Some(PendingAcsStore::open(&dir.join("pending_acs.db")).context("acs store")?),
            )
        }
        None => (None, None, None),
    };
    let regs = RegistrationTable::new(reg_store).context("registration table")?;
    let custody = CustodyManager::new(local_eid.clone(), acs_store);

    // Routing.
    let mut router = StaticRouter::new(local_eid.clone());
    for route in &config.routes {
        let mode = match route.mode.as_deref() {
            Some("copy") => ForwardingMode::ForwardCopy,
            None | Some("unique") => ForwardingMode::ForwardUnique,
            Some(other) => bail!("route mode {other}"),
        };
        router.route_table().add(RouteEntry {
            pattern: EndpointId::parse(&route.pattern)
                .map_err(|e| anyhow::anyhow!("route pattern: {e}"))?,
            link: route.link.clone(),
            mode,
        });
    }

    // Convergence layers.
    let ltp_params = build_ltp_params(&config)?;
    let mut clas = ClaRegistry::new();
    clas.register(Arc::new(UdpCla::new(protocol.clone())));
    clas.register(Arc::new(TcpCla::new(protocol.clone())));
    clas.register(Arc::new(LtpCla::new(protocol.clone(), ltp_params)));
    let clas = Arc::new(clas);

    let mut node_config = NodeConfig::new(local_eid.clone());
    node_config.payload_dir = config.payload_dir.clone();

    let daemon = BundleDaemon::new(
        node_config,
        protocol,
        Box::new(router),
        regs,
        bundle_store,
        custody,
        clas.clone(),
    );
    let handle = daemon.handle();
    let contacts = daemon.contacts();
    let regs = daemon.registrations();

    // Configured links exist before the daemon starts draining events.
    for link_config in &config.links {
        let mut params = LinkParams::default();
        params.mtu = link_config.mtu;
        if let Some(v) = link_config.retry_interval_secs {
            params.retry_interval_secs = v;
            params.min_retry_interval_secs = v;
        }
        if let Some(v) = link_config.max_retry_interval_secs {
            params.max_retry_interval_secs = v;
        }
        let link = Link::new(&link_config.name, &link_config.cla, &link_config.nexthop, params);
        contacts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .add_link(link)
            .map_err(|e| anyhow::anyhow!("link {}: {e}", link_config.name))?;
        handle.post(BundleEvent::LinkCreated { link: link_config.name.clone() });
        if link_config.available.unwrap_or(true) {
            handle.post(BundleEvent::LinkAvailable { link: link_config.name.clone() });
        }
    }

    let join = tokio::spawn(daemon.run());

    // Listening interfaces.
    for iface in config.enabled_interfaces() {
        let cla = clas
            .find(&iface.cla)
            .with_context(|| format!("interface {} names unknown cla {}", iface.name, iface.cla))?;
        cla.start_interface(
            InterfaceParams { name: iface.name.clone(), local_addr: iface.listen.clone() },
            handle.clone(),
        )
        .await
        .with_context(|| format!("interface {}", iface.name))?;
    }

    // Application API.
    let (api_addr, api_port) = config.api_bind();
    let api_port = api::start(
        &api_addr,
        api_port,
        ApiContext { daemon: handle.clone(), regs: regs.clone(), local_eid: local_eid.clone() },
    )
    .await
    .context("api listener")?;

    // Admin channel.
    let mut admin = AdminChannel::new();
    admin::register_core_verbs(
        &mut admin,
        AdminContext {
            daemon: handle.clone(),
            contacts: contacts.clone(),
            regs: regs.clone(),
            steward,
        },
    );

    Ok(NodeRuntime { handle, contacts, regs, admin, local_eid, api_port, join })
}
