use petrel_bp::{BpError, SecurityLocals};

use crate::items::{decode_items, encode_items};

/// Abstract-security-block flag bits.
pub mod cs_flags {
    pub const HAS_SOURCE: u64 = 0x10;
    pub const HAS_DEST: u64 = 0x08;
    pub const HAS_PARAMS: u64 = 0x04;
    pub const HAS_CORRELATOR: u64 = 0x02;
    pub const HAS_RESULT: u64 = 0x01;
}

/// Which ciphersuites the node applies to outbound bundles.
#[derive(Debug, Clone, Default)]
pub struct SecurityPolicy {
    pub ba1: bool,
    pub pi2: bool,
    pub pc3: bool,
    pub es4: bool,
    /// Key id presented in BA1 parameters and expected of peers.
    pub ba1_key_id: u64,
}

/// Serialize the abstract security block body carried as a security
/// block's data: ciphersuite, flags, then the optional fields the flags
/// declare.
pub fn encode_security_data(locals: &SecurityLocals) -> Vec<u8> {
    let mut flags = locals.cs_flags;
    if locals.correlator != 0 {
        flags |= cs_flags::HAS_CORRELATOR;
    }
    if !locals.params.is_empty() {
        flags |= cs_flags::HAS_PARAMS;
    }
    if !locals.result.is_empty() {
        flags |= cs_flags::HAS_RESULT;
    }
    if locals.security_src.is_some() {
        flags |= cs_flags::HAS_SOURCE;
    }
    if locals.security_dest.is_some() {
        flags |= cs_flags::HAS_DEST;
    }

    let mut out = Vec::with_capacity(32);
    petrel_sdnv::append(locals.ciphersuite as u64, &mut out);
    petrel_sdnv::append(flags, &mut out);
    if flags & cs_flags::HAS_CORRELATOR != 0 {
        petrel_sdnv::append(locals.correlator, &mut out);
    }
    if flags & cs_flags::HAS_PARAMS != 0 {
        let params = encode_items(&locals.params);
        petrel_sdnv::append(params.len() as u64, &mut out);
        out.extend_from_slice(&params);
    }
    if flags & cs_flags::HAS_RESULT != 0 {
        let result = encode_items(&locals.result);
        petrel_sdnv::append(result.len() as u64, &mut out);
        out.extend_from_slice(&result);
    }
    out
}

/// Parse an abstract security block body into per-block locals. Security
/// source/dest are resolved from the block's EID references by the caller.
pub fn decode_security_data(mut data: &[u8]) -> Result<SecurityLocals, BpError> {
    let ciphersuite = petrel_sdnv::decode_advance(&mut data)?;
    if ciphersuite > u8::MAX as u64 {
        return Err(BpError::Malformed("ciphersuite number out of range"));
    }
    let flags = petrel_sdnv::decode_advance(&mut data)?;

    let correlator = if flags & cs_flags::HAS_CORRELATOR != 0 {
        petrel_sdnv::decode_advance(&mut data)?
    } else {
        0
    };

    let params = if flags & cs_flags::HAS_PARAMS != 0 {
        let len = petrel_sdnv::decode_advance(&mut data)? as usize;
        if data.len() < len {
            return Err(BpError::Malformed("security params extend past block"));
        }
        let items = decode_items(&data[..len])?;
        data = &data[len..];
        items
    } else {
        Vec::new()
    };

    let result = if flags & cs_flags::HAS_RESULT != 0 {
        let len = petrel_sdnv::decode_advance(&mut data)? as usize;
        if data.len() < len {
            return Err(BpError::Malformed("security result extends past block"));
        }
        decode_items(&data[..len])?
    } else {
        Vec::new()
    };

    Ok(SecurityLocals {
        ciphersuite: ciphersuite as u8,
        cs_flags: flags,
        correlator,
        params,
        result,
        security_src: None,
        security_dest: None,
        session_key: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::items::item_type;
    use petrel_bp::SecurityItem;

    #[test]
    fn security_data_roundtrip() {
        let locals = SecurityLocals {
            ciphersuite: 1,
            cs_flags: 0,
            correlator: 42,
            params: vec![SecurityItem { item_type: item_type::KEY_INFO, value: vec![5; 3] }],
            result: vec![SecurityItem { item_type: item_type::ICV, value: vec![6; 20] }],
            ..Default::default()
        };
        let encoded = encode_security_data(&locals);
        let decoded = decode_security_data(&encoded).expect("decode");
        assert_eq!(decoded.ciphersuite, 1);
        assert_eq!(decoded.correlator, 42);
        assert_eq!(decoded.params, locals.params);
        assert_eq!(decoded.result, locals.result);
        assert!(decoded.cs_flags & cs_flags::HAS_CORRELATOR != 0);
    }

    #[test]
    fn minimal_block() {
        let locals = SecurityLocals { ciphersuite: 2, ..Default::default() };
        let decoded = decode_security_data(&encode_security_data(&locals)).expect("decode");
        assert_eq!(decoded.ciphersuite, 2);
        assert_eq!(decoded.correlator, 0);
        assert!(decoded.params.is_empty());
        assert!(decoded.result.is_empty());
    }
}
