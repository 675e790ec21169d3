//! Stable placement of entities onto partitions.
//!
//! The partition key is the 64-bit FNV-1a hash of the lower-cased entity name,
//! reinterpreted as a signed integer so it lines up with `i64` partition
//! ranges. No seed, no process-local state: a device always lands on the
//! same key across restarts and machines.

pub type PartitionKey = i64;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

pub fn fnv1a64(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Maps an entity name (device id, user name) to its partition key.
pub fn route(entity_name: &str) -> PartitionKey {
    fnv1a64(entity_name.to_lowercase().as_bytes()) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv_reference_vectors() {
        assert_eq!(fnv1a64(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a64(b"a"), 0xaf63dc4c8601ec8c);
        assert_eq!(fnv1a64(b"foobar"), 0x85944171f73967e8);
    }

    #[test]
    fn test_route_is_case_insensitive() {
        assert_eq!(route("Dev1"), route("dev1"));
        assert_eq!(route("DEV1"), route("dev1"));
    }

    #[test]
    fn test_route_is_stable() {
        assert_eq!(route("foobar"), 0x85944171f73967e8_u64 as i64);
        assert_eq!(route("sensor-hub-7"), route("sensor-hub-7"));
        assert_ne!(route("dev1"), route("dev2"));
    }
}
