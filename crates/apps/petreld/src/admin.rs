//! Admin command channel: the console surface is external, the core just
//! exposes one registration function per verb and executes text commands.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use petrel_bp::EndpointId;
use petrel_node::daemon::DaemonHandle;
use petrel_node::event::{BundleEvent, ContactDownReason};
use petrel_node::reg::{FailureAction, Registration, RegistrationTable};
use petrel_node::router::{ForwardingMode, RouteEntry};
use petrel_node::{ContactManager, Link, LinkParams, LinkState, NodeError};
use petrel_security::StaticKeySteward;

pub type AdminHandler = Box<dyn Fn(&[&str]) -> Result<String, NodeError> + Send + Sync>;

/// A registry of admin verbs. The transport feeding lines in (console,
/// socket, script) is an external collaborator.
#[derive(Default)]
pub struct AdminChannel {
    verbs: HashMap<String, AdminHandler>,
}

impl AdminChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one verb.
    pub fn register_verb(&mut self, verb: &str, handler: AdminHandler) {
        self.verbs.insert(verb.to_string(), handler);
    }

    pub fn verbs(&self) -> Vec<&str> {
        self.verbs.keys().map(String::as_str).collect()
    }

    /// Execute one command line: `<verb> [args...]`.
    pub fn process_line(&self, line: &str) -> Result<String, NodeError> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some((verb, args)) = parts.split_first() else {
            return Ok(String::new());
        };
        let handler = self
            .verbs
            .get(*verb)
            .ok_or_else(|| NodeError::Policy(format!("unknown verb {verb}")))?;
        handler(args)
    }
}

#[derive(Clone)]
pub struct AdminContext {
    pub daemon: DaemonHandle,
    pub contacts: Arc<Mutex<ContactManager>>,
    pub regs: Arc<Mutex<RegistrationTable>>,
    pub steward: Arc<StaticKeySteward>,
}

fn parse_eid(s: &str) -> Result<EndpointId, NodeError> {
    EndpointId::parse(s).map_err(|e| NodeError::Policy(e.to_string()))
}

/// Wire up the core verbs: route, link, registration, bundle, security.
pub fn register_core_verbs(chan: &mut AdminChannel, ctx: AdminContext) {
    {
        let ctx = ctx.clone();
        chan.register_verb(
            "route",
            Box::new(move |args| match args {
                ["add", pattern, link, rest @ ..] => {
                    let mode = match rest.first() {
                        Some(&"copy") => ForwardingMode::ForwardCopy,
                        Some(&"unique") | None => ForwardingMode::ForwardUnique,
                        Some(other) => {
                            return Err(NodeError::Policy(format!("bad mode {other}")))
                        }
                    };
                    ctx.daemon.post(BundleEvent::RouteAdd {
                        entry: RouteEntry {
                            pattern: parse_eid(pattern)?,
                            link: link.to_string(),
                            mode,
                        },
                    });
                    Ok(format!("route {pattern} -> {link}"))
                }
                ["del", pattern] => {
                    ctx.daemon.post(BundleEvent::RouteDel { pattern: parse_eid(pattern)? });
                    Ok(format!("route {pattern} removed"))
                }
                _ => Err(NodeError::Policy("usage: route add|del ...".into())),
            }),
        );
    }

    {
        let ctx = ctx.clone();
        chan.register_verb(
            "link",
            Box::new(move |args| match args {
                ["add", name, cla, nexthop, rest @ ..] => {
                    let mut params = LinkParams::default();
                    if let Some(mtu) = rest.first() {
                        params.mtu = Some(
                            mtu.parse()
                                .map_err(|_| NodeError::Policy(format!("bad mtu {mtu}")))?,
                        );
                    }
                    let link = Link::new(name, cla, nexthop, params);
                    ctx.contacts
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .add_link(link)?;
                    ctx.daemon.post(BundleEvent::LinkCreated { link: name.to_string() });
                    ctx.daemon.post(BundleEvent::LinkAvailable { link: name.to_string() });
                    Ok(format!("link {name} added"))
                }
                ["del", name] => {
                    ctx.contacts.lock().unwrap_or_else(|e| e.into_inner()).del_link(name);
                    ctx.daemon.post(BundleEvent::LinkDeleted { link: name.to_string() });
                    Ok(format!("link {name} deleted"))
                }
                ["open", name] => {
                    ctx.daemon.post(BundleEvent::LinkStateChangeRequest {
                        link: name.to_string(),
                        state: LinkState::Opening,
                        reason: ContactDownReason::User,
                    });
                    Ok(format!("link {name} opening"))
                }
                ["close", name] => {
                    ctx.daemon.post(BundleEvent::LinkStateChangeRequest {
                        link: name.to_string(),
                        state: LinkState::Unavailable,
                        reason: ContactDownReason::User,
                    });
                    Ok(format!("link {name} closing"))
                }
                ["stats", name] => {
                    let contacts = ctx.contacts.lock().unwrap_or_else(|e| e.into_inner());
                    let link = contacts
                        .find(name)
                        .ok_or_else(|| NodeError::Policy(format!("no such link {name}")))?;
                    let state = link.state();
                    let depth = link.queue_depth();
                    Ok(link.with_stats(|s| {
                        format!(
                            "link {name}: {state:?}, {depth} queued, {} queued total, {} transmitted, {} cancelled, {} contacts ({} attempts)",
                            s.bundles_queued,
                            s.bundles_transmitted,
                            s.bundles_cancelled,
                            s.contacts,
                            s.contact_attempts,
                        )
                    }))
                }
                _ => Err(NodeError::Policy("usage: link add|del|open|close|stats ...".into())),
            }),
        );
    }

    {
        let ctx = ctx.clone();
        chan.register_verb(
            "registration",
            Box::new(move |args| match args {
                ["add", endpoint, rest @ ..] => {
                    let action = match rest.first() {
                        Some(s) => FailureAction::parse(s)
                            .ok_or_else(|| NodeError::Policy(format!("bad action {s}")))?,
                        None => FailureAction::Defer,
                    };
                    let mut regs = ctx.regs.lock().unwrap_or_else(|e| e.into_inner());
                    let regid = regs.next_regid();
                    regs.add(Registration::new(regid, parse_eid(endpoint)?, action, 0, None))?;
                    drop(regs);
                    ctx.daemon.post(BundleEvent::RegistrationAdded { regid });
                    Ok(format!("registration {regid} for {endpoint}"))
                }
                ["del", regid] => {
                    let regid: u32 = regid
                        .parse()
                        .map_err(|_| NodeError::Policy(format!("bad regid {regid}")))?;
                    ctx.regs.lock().unwrap_or_else(|e| e.into_inner()).del(regid)?;
                    ctx.daemon.post(BundleEvent::RegistrationRemoved { regid });
                    Ok(format!("registration {regid} removed"))
                }
                ["list"] => {
                    let regs = ctx.regs.lock().unwrap_or_else(|e| e.into_inner());
                    Ok(format!("{} registrations", regs.len()))
                }
                _ => Err(NodeError::Policy("usage: registration add|del|list ...".into())),
            }),
        );
    }

    {
        let ctx = ctx.clone();
        chan.register_verb(
            "bundle",
            Box::new(move |args| match args {
                ["stats"] => {
                    let contacts = ctx.contacts.lock().unwrap_or_else(|e| e.into_inner());
                    let queued: usize = contacts.links().map(|l| l.queue_depth()).sum();
                    let links = contacts.links().count();
                    let (transmitted, cancelled) = contacts.links().fold((0, 0), |acc, l| {
                        l.with_stats(|s| {
                            (acc.0 + s.bundles_transmitted, acc.1 + s.bundles_cancelled)
                        })
                    });
                    drop(contacts);
                    let regs = ctx.regs.lock().unwrap_or_else(|e| e.into_inner()).len();
                    Ok(format!(
                        "{links} links, {queued} queued, {transmitted} transmitted, {cancelled} cancelled, {regs} registrations"
                    ))
                }
                _ => Err(NodeError::Policy("usage: bundle stats".into())),
            }),
        );
    }

    {
        let ctx = ctx;
        chan.register_verb(
            "security",
            Box::new(move |args| match args {
                ["key", peer, key_id, hexkey] => {
                    let key_id: u64 = key_id
                        .parse()
                        .map_err(|_| NodeError::Policy(format!("bad key id {key_id}")))?;
                    let key = hex::decode(hexkey)
                        .map_err(|e| NodeError::Policy(format!("bad key hex: {e}")))?;
                    ctx.steward.set_hmac_key(&parse_eid(peer)?, key_id, key);
                    Ok(format!("key {key_id} set for {peer}"))
                }
                _ => Err(NodeError::Policy("usage: security key <eid> <id> <hex>".into())),
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use petrel_node::daemon::DaemonHandle;
    use petrel_security::KeySteward;

    fn channel() -> (AdminChannel, AdminContext) {
        let (daemon, _rx) = DaemonHandle::detached();
        let ctx = AdminContext {
            daemon,
            contacts: Arc::new(Mutex::new(ContactManager::new())),
            regs: Arc::new(Mutex::new(RegistrationTable::new(None).expect("table"))),
            steward: Arc::new(StaticKeySteward::new()),
        };
        let mut chan = AdminChannel::new();
        register_core_verbs(&mut chan, ctx.clone());
        (chan, ctx)
    }

    #[test]
    fn link_and_registration_verbs() {
        let (chan, ctx) = channel();
        chan.process_line("link add l1 udp 127.0.0.1:4556").expect("link add");
        assert!(ctx.contacts.lock().expect("lock").find("l1").is_some());

        chan.process_line("registration add dtn://node/app defer").expect("reg add");
        assert_eq!(ctx.regs.lock().expect("lock").len(), 1);

        let stats = chan.process_line("bundle stats").expect("stats");
        assert!(stats.contains("1 links"));
        assert!(stats.contains("0 transmitted"));

        let link_stats = chan.process_line("link stats l1").expect("link stats");
        assert!(link_stats.contains("Unavailable"));
        assert!(link_stats.contains("0 cancelled"));
        assert!(chan.process_line("link stats nope").is_err());
    }

    #[test]
    fn bad_commands_rejected() {
        let (chan, _ctx) = channel();
        assert!(chan.process_line("nonsense verb").is_err());
        assert!(chan.process_line("route add not-an-eid l1").is_err());
        assert!(chan.process_line("security key dtn://p x yz").is_err());
        assert!(chan.process_line("").expect("empty ok").is_empty());
    }

    #[test]
    fn security_key_verb() {
        let (chan, ctx) = channel();
        chan.process_line("security key dtn://peer 3 00112233").expect("key");
        let key = ctx
            .steward
            .hmac_key(&EndpointId::parse("dtn://peer").expect("eid"), 3)
            .expect("stored");
        assert_eq!(key.as_slice(), &[0x00, 0x11, 0x22, 0x33]);
    }
}
