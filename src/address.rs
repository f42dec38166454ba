/// LE device address type as reported in advertising reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AddressKind {
    /// Public device address
    Public,
    /// Random (static or private) device address
    Random,
}

/// An LE device address (`BD_ADDR` plus address type)
///
/// Bytes are stored in little-endian order, the way they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LeAddress {
    /// Address type
    pub kind: AddressKind,
    /// Raw address bytes, least significant byte first
    pub bytes: [u8; 6],
}

impl LeAddress {
    /// Create a public address from little-endian bytes
    #[must_use]
    pub const fn public(bytes: [u8; 6]) -> Self {
        Self {
            kind: AddressKind::Public,
            bytes,
        }
    }

    /// Create a random address from little-endian bytes
    #[must_use]
    pub const fn random(bytes: [u8; 6]) -> Self {
        Self {
            kind: AddressKind::Random,
            bytes,
        }
    }

    /// Format the address most significant byte first, e.g. `C0:11:22:33:44:55`
    #[must_use]
    pub fn format_hex(&self) -> heapless::String<17> {
        const HEX: &[u8; 16] = b"0123456789ABCDEF";
        let mut result = heapless::String::new();
        for (i, byte) in self.bytes.iter().rev().enumerate() {
            if i > 0 {
                result.push(':').ok();
            }
            result.push(char::from(HEX[usize::from(byte >> 4)])).ok();
            result.push(char::from(HEX[usize::from(byte & 0x0F)])).ok();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_hex_is_msb_first() {
        let addr = LeAddress::public([0x55, 0x44, 0x33, 0x22, 0x11, 0xC0]);
        assert_eq!(addr.format_hex().as_str(), "C0:11:22:33:44:55");
    }
}
