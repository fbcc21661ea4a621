use petrel_bp::{BpError, SecurityItem};

/// Item type codes shared by security-parameters and security-result
/// fields.
pub mod item_type {
    pub const IV: u8 = 1;
    pub const KEY_INFO: u8 = 3;
    pub const FRAGMENT_RANGE: u8 = 4;
    pub const SALT: u8 = 7;
    pub const ICV: u8 = 8;
    pub const ENCAPSULATED_BLOCK: u8 = 10;
}

/// Serialize an item list: each item is `type (1) | len (SDNV) | value`.
pub fn encode_items(items: &[SecurityItem]) -> Vec<u8> {
    let mut out = Vec::new();
    for item in items {
        out.push(item.item_type);
        petrel_sdnv::append(item.value.len() as u64, &mut out);
        out.extend_from_slice(&item.value);
    }
    out
}

pub fn decode_items(mut data: &[u8]) -> Result<Vec<SecurityItem>, BpError> {
    let mut items = Vec::new();
    while !data.is_empty() {
        let item_type = data[0];
        data = &data[1..];
        let len = petrel_sdnv::decode_advance(&mut data)? as usize;
        if data.len() < len {
            return Err(BpError::Malformed("security item extends past field"));
        }
        items.push(SecurityItem { item_type, value: data[..len].to_vec() });
        data = &data[len..];
    }
    Ok(items)
}

pub fn find_item<'a>(items: &'a [SecurityItem], item_type: u8) -> Option<&'a [u8]> {
    items.iter().find(|i| i.item_type == item_type).map(|i| i.value.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_list_roundtrip() {
        let items = vec![
            SecurityItem { item_type: item_type::IV, value: vec![1; 8] },
            SecurityItem { item_type: item_type::SALT, value: vec![2; 4] },
            SecurityItem { item_type: item_type::ICV, value: vec![3; 20] },
        ];
        let encoded = encode_items(&items);
        let decoded = decode_items(&encoded).expect("decode");
        assert_eq!(decoded, items);
        assert_eq!(find_item(&decoded, item_type::SALT), Some(&[2u8; 4][..]));
        assert_eq!(find_item(&decoded, item_type::KEY_INFO), None);
    }

    #[test]
    fn truncated_item_rejected() {
        let mut encoded = encode_items(&[SecurityItem {
            item_type: item_type::ICV,
            value: vec![9; 10],
        }]);
        encoded.truncate(encoded.len() - 1);
        assert!(decode_items(&encoded).is_err());
    }
}
