use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::error::Error;

// `RandomState` is seeded from OS randomness once per process and is the
// same mechanism `HashMap`'s default hasher uses to resist HashDoS — it's
// exactly the "one-time, process-lifetime random value" the key derivation
// needs, without pulling in a `rand` dependency.
static SEED: OnceLock<RandomState> = OnceLock::new();

fn seed() -> &'static RandomState {
    SEED.get_or_init(RandomState::new)
}

/// Computes the 32-bit endpoint key for `(ip, port)`.
///
/// Two pools for the same endpoint always produce the same key within one
/// process run. Parse failure on `ip` yields [`Error::InvalidInput`].
pub(crate) fn endpoint_key(ip: &str, port: u16) -> Result<u32, Error> {
    let addr = Ipv4Addr::from_str(ip).map_err(|_| Error::InvalidInput)?;
    let mut hasher = seed().build_hasher();
    hasher.write_u32(u32::from(addr));
    hasher.write_u16(port);
    Ok(hasher.finish() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_endpoint_same_key() {
        let a = endpoint_key("10.0.0.1", 80).unwrap();
        let b = endpoint_key("10.0.0.1", 80).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn different_endpoints_usually_differ() {
        let a = endpoint_key("10.0.0.1", 80).unwrap();
        let b = endpoint_key("10.0.0.2", 80).unwrap();
        let c = endpoint_key("10.0.0.1", 81).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn invalid_ip_is_rejected() {
        assert_eq!(endpoint_key("not-an-ip", 80), Err(Error::InvalidInput));
        assert_eq!(endpoint_key("2001:db8::1", 80), Err(Error::InvalidInput));
    }
}
