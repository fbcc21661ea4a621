use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};

use petrel_bp::{Bundle, BundleProtocol, BundleRef};

use crate::error::NodeError;
use crate::reg::RegistrationRef;

/// A bundle row as persisted: the wire image plus a header describing
/// where the payload lives.
#[derive(Debug)]
pub struct StoredBundle {
    pub id: u64,
    pub gbofid: String,
    pub image: Vec<u8>,
    pub payload_file: Option<PathBuf>,
}

/// Durable map of bundles keyed by local id. Values are serialized with
/// the same codec used on the wire; a bare codec instance is used so
/// security processors never run on the store path.
pub struct BundleStore {
    conn: Connection,
    codec: BundleProtocol,
}

impl BundleStore {
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn, codec: BundleProtocol::default() };
        store.init_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn, codec: BundleProtocol::default() };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> rusqlite::Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS bundles (
                id INTEGER PRIMARY KEY,
                gbofid TEXT NOT NULL,
                image BLOB NOT NULL,
                payload_file TEXT
            );",
        )
    }

    fn serialize(&self, bundle: &Bundle) -> Result<Vec<u8>, NodeError> {
        let xmit = self.codec.prepare_blocks(bundle, "@store")?;
        let image = self.codec.produce_all(bundle, &xmit)?;
        bundle.state().xmit_blocks.remove("@store");
        Ok(image)
    }

    pub fn add(&self, bundle: &BundleRef) -> Result<(), NodeError> {
        let image = self.serialize(bundle)?;
        let payload_file = bundle
            .state()
            .payload
            .file_path()
            .map(|p| p.to_string_lossy().into_owned());
        self.conn.execute(
            "INSERT OR REPLACE INTO bundles (id, gbofid, image, payload_file) VALUES (?1, ?2, ?3, ?4)",
            params![bundle.id() as i64, bundle.gbofid(), image, payload_file],
        )?;
        Ok(())
    }

    pub fn update(&self, bundle: &BundleRef) -> Result<(), NodeError> {
        self.add(bundle)
    }

    pub fn del(&self, id: u64) -> Result<bool, NodeError> {
        let n = self.conn.execute("DELETE FROM bundles WHERE id = ?1", params![id as i64])?;
        Ok(n > 0)
    }

    pub fn get(&self, id: u64) -> Result<Option<StoredBundle>, NodeError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, gbofid, image, payload_file FROM bundles WHERE id = ?1")?;
        let mut rows = stmt.query(params![id as i64])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_stored(row)?)),
            None => Ok(None),
        }
    }

    pub fn iterate(&self) -> Result<Vec<StoredBundle>, NodeError> {
        let mut stmt =
            self.conn.prepare("SELECT id, gbofid, image, payload_file FROM bundles")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_stored(row)?);
        }
        Ok(out)
    }

    /// Rebuild a bundle from its stored row. File-backed payloads are
    /// re-attached from disk, replacing the inline copy.
    pub fn reload(&self, stored: &StoredBundle) -> Result<Bundle, NodeError> {
        let bundle = self.codec.consume_all(&stored.image)?;
        if let Some(path) = stored.payload_file.as_ref() {
            match petrel_bp::payload::BundlePayload::attach_file(path.clone()) {
                Ok(payload) => bundle.state().payload = payload,
                Err(e) => {
                    log::warn!(
                        "store: payload file {} lost ({}), using inline copy",
                        path.display(),
                        e
                    );
                }
            }
        }
        Ok(bundle)
    }

    pub fn count(&self) -> Result<u64, NodeError> {
        let n: i64 = self.conn.query_row("SELECT COUNT(*) FROM bundles", [], |r| r.get(0))?;
        Ok(n as u64)
    }
}

fn row_to_stored(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredBundle> {
    let id: i64 = row.get(0)?;
    let payload_file: Option<String> = row.get(3)?;
    Ok(StoredBundle {
        id: id as u64,
        gbofid: row.get(1)?,
        image: row.get(2)?,
        payload_file: payload_file.map(PathBuf::from),
    })
}

#[derive(Debug, Clone)]
pub struct RegRecord {
    pub regid: u32,
    pub endpoint: String,
    pub failure_action: String,
    pub expiration_secs: u64,
    pub script: Option<String>,
}

/// Durable map of non-reserved registrations keyed by regid.
pub struct RegistrationStore {
    conn: Connection,
}

impl RegistrationStore {
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> rusqlite::Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS registrations (
                regid INTEGER PRIMARY KEY,
                endpoint TEXT NOT NULL,
                failure_action TEXT NOT NULL,
                expiration INTEGER NOT NULL,
                script TEXT
            );",
        )
    }

    pub fn add(&self, reg: &RegistrationRef) -> Result<(), NodeError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO registrations (regid, endpoint, failure_action, expiration, script) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                reg.regid,
                reg.endpoint.to_string(),
                reg.failure_action.as_str(),
                reg.expiration_secs as i64,
                reg.script,
            ],
        )?;
        Ok(())
    }

    pub fn del(&self, regid: u32) -> Result<bool, NodeError> {
        let n = self
            .conn
            .execute("DELETE FROM registrations WHERE regid = ?1", params![regid])?;
        Ok(n > 0)
    }

    pub fn get(&self, regid: u32) -> Result<Option<RegRecord>, NodeError> {
        let mut stmt = self.conn.prepare(
            "SELECT regid, endpoint, failure_action, expiration, script FROM registrations WHERE regid = ?1",
        )?;
        let mut rows = stmt.query(params![regid])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_reg(row)?)),
            None => Ok(None),
        }
    }

    pub fn iterate(&self) -> Result<Vec<RegRecord>, NodeError> {
        let mut stmt = self.conn.prepare(
            "SELECT regid, endpoint, failure_action, expiration, script FROM registrations",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_reg(row)?);
        }
        Ok(out)
    }
}

fn row_to_reg(row: &rusqlite::Row<'_>) -> rusqlite::Result<RegRecord> {
    let expiration: i64 = row.get(3)?;
    Ok(RegRecord {
        regid: row.get(0)?,
        endpoint: row.get(1)?,
        failure_action: row.get(2)?,
        expiration_secs: expiration as u64,
        script: row.get(4)?,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAcsRecord {
    /// Fingerprint of the custody signal: custodian EID plus the subject
    /// bundle's global id.
    pub fingerprint: String,
    pub custodian: String,
    pub gbofid: String,
    pub succeeded: bool,
    pub reason: u8,
}

/// Durable map of custody signals awaiting acknowledgment, keyed by
/// fingerprint.
pub struct PendingAcsStore {
    conn: Connection,
}

impl PendingAcsStore {
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> rusqlite::Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS pending_acs (
                fingerprint TEXT PRIMARY KEY,
                custodian TEXT NOT NULL,
                gbofid TEXT NOT NULL,
                succeeded INTEGER NOT NULL,
                reason INTEGER NOT NULL
            );",
        )
    }

    pub fn add(&self, rec: &PendingAcsRecord) -> Result<(), NodeError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO pending_acs (fingerprint, custodian, gbofid, succeeded, reason) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![rec.fingerprint, rec.custodian, rec.gbofid, rec.succeeded, rec.reason],
        )?;
        Ok(())
    }

    pub fn del(&self, fingerprint: &str) -> Result<bool, NodeError> {
        let n = self
            .conn
            .execute("DELETE FROM pending_acs WHERE fingerprint = ?1", params![fingerprint])?;
        Ok(n > 0)
    }

    pub fn get(&self, fingerprint: &str) -> Result<Option<PendingAcsRecord>, NodeError> {
        let mut stmt = self.conn.prepare(
            "SELECT fingerprint, custodian, gbofid, succeeded, reason FROM pending_acs WHERE fingerprint = ?1",
        )?;
        let mut rows = stmt.query(params![fingerprint])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_acs(row)?)),
            None => Ok(None),
        }
    }

    pub fn iterate(&self) -> Result<Vec<PendingAcsRecord>, NodeError> {
        let mut stmt = self
            .conn
            .prepare("SELECT fingerprint, custodian, gbofid, succeeded, reason FROM pending_acs")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_acs(row)?);
        }
        Ok(out)
    }
}

fn row_to_acs(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingAcsRecord> {
    Ok(PendingAcsRecord {
        fingerprint: row.get(0)?,
        custodian: row.get(1)?,
        gbofid: row.get(2)?,
        succeeded: row.get(3)?,
        reason: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reg::{FailureAction, Registration};
    use petrel_bp::payload::BundlePayload;
    use petrel_bp::EndpointId;
    use std::sync::Arc;

    fn sample_bundle() -> BundleRef {
        let mut b = Bundle::new();
        b.source = EndpointId::parse("dtn://src/app").expect("parse");
        b.dest = EndpointId::parse("dtn://dst/app").expect("parse");
        b.lifetime_secs = 500;
        b.set_payload(BundlePayload::with_memory(b"stored payload".to_vec()));
        Arc::new(b)
    }

    #[test]
    fn bundle_store_roundtrip() {
        let store = BundleStore::in_memory().expect("open");
        let bundle = sample_bundle();
        store.add(&bundle).expect("add");
        assert_eq!(store.count().expect("count"), 1);

        let stored = store.get(bundle.id()).expect("get").expect("present");
        assert_eq!(stored.gbofid, bundle.gbofid());
        let reloaded = store.reload(&stored).expect("reload");
        assert_eq!(reloaded.dest, bundle.dest);
        assert_eq!(reloaded.creation_ts, bundle.creation_ts);
        assert_eq!(
            reloaded.state().payload.read_all().expect("read"),
            b"stored payload"
        );

        assert!(store.del(bundle.id()).expect("del"));
        assert!(!store.del(bundle.id()).expect("del"));
        assert_eq!(store.count().expect("count"), 0);
    }

    #[test]
    fn registration_store_roundtrip() {
        let store = RegistrationStore::in_memory().expect("open");
        let reg = Registration::new(
            42,
            EndpointId::parse("dtn://node/app").expect("parse"),
            FailureAction::Defer,
            3600,
            None,
        );
        store.add(&reg).expect("add");
        let rec = store.get(42).expect("get").expect("present");
        assert_eq!(rec.endpoint, "dtn://node/app");
        assert_eq!(rec.failure_action, "defer");
        assert_eq!(store.iterate().expect("iterate").len(), 1);
        assert!(store.del(42).expect("del"));
    }

    #[test]
    fn pending_acs_roundtrip() {
        let store = PendingAcsStore::in_memory().expect("open");
        let rec = PendingAcsRecord {
            fingerprint: "dtn://prev|b1".into(),
            custodian: "dtn://prev".into(),
            gbofid: "b1".into(),
            succeeded: true,
            reason: 0,
        };
        store.add(&rec).expect("add");
        assert_eq!(store.get("dtn://prev|b1").expect("get"), Some(rec.clone()));
        assert_eq!(store.iterate().expect("iterate").len(), 1);
        assert!(store.del(&rec.fingerprint).expect("del"));
    }
}
