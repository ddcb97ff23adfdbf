use crate::Error;
use bech32::{Bech32, Hrp};

/// 32-byte public key of a site publisher.
///
/// The printable form is the bech32 `npub` encoding, which is what appears
/// as the subdomain label of a hosted site. Cache keys and wire filters use
/// the lowercase hex form.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pubkey([u8; 32]);

const NPUB_HRP: Hrp = Hrp::parse_unchecked("npub");

impl Pubkey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Decode a bech32 `npub` string. Anything that is not a well-formed
    /// bech32 string with the `npub` prefix and a 32-byte payload is
    /// rejected.
    pub fn from_npub(s: &str) -> crate::Result<Self> {
        let (hrp, data) = bech32::decode(s).map_err(|_| Error::InvalidPubkey)?;
        if hrp != NPUB_HRP {
            return Err(Error::InvalidPubkey);
        }
        let bytes: [u8; 32] = data.try_into().map_err(|_| Error::InvalidPubkey)?;
        Ok(Self(bytes))
    }

    pub fn to_npub(&self) -> String {
        bech32::encode::<Bech32>(NPUB_HRP, &self.0).expect("32-byte payload is within bech32 limits")
    }

    pub fn from_hex(s: &str) -> crate::Result<Self> {
        let data = hex::decode(s).map_err(|_| Error::InvalidPubkey)?;
        let bytes: [u8; 32] = data.try_into().map_err(|_| Error::InvalidPubkey)?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for Pubkey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_npub())
    }
}

impl std::fmt::Debug for Pubkey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Pubkey({})", self.to_npub())
    }
}

impl std::str::FromStr for Pubkey {
    type Err = Error;

    // Accept either encoding; npub is tried first because it is self-tagging.
    fn from_str(s: &str) -> crate::Result<Self> {
        Self::from_npub(s).or_else(|_| Self::from_hex(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn npub_round_trip() {
        let key = Pubkey::from_bytes([7u8; 32]);
        let npub = key.to_npub();
        assert!(npub.starts_with("npub1"));
        assert_eq!(Pubkey::from_npub(&npub).unwrap(), key);
    }

    #[test]
    fn hex_round_trip() {
        let key = Pubkey::from_bytes([0xab; 32]);
        assert_eq!(Pubkey::from_hex(&key.to_hex()).unwrap(), key);
    }

    #[test]
    fn rejects_wrong_prefix() {
        let other = bech32::encode::<Bech32>(Hrp::parse("nsec").unwrap(), &[7u8; 32]).unwrap();
        assert!(Pubkey::from_npub(&other).is_err());
    }

    #[test]
    fn rejects_wrong_length() {
        let short = bech32::encode::<Bech32>(Hrp::parse("npub").unwrap(), &[7u8; 16]).unwrap();
        assert!(Pubkey::from_npub(&short).is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(Pubkey::from_npub("not-bech32-at-all").is_err());
        assert!(Pubkey::from_hex("abcd").is_err());
    }
}
