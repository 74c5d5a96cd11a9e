//! Various utility functions

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Returns the hash of the given input using [`DefaultHasher`]
pub fn calculate_hash<T: Hash>(t: &T) -> u64 {
    let mut s = DefaultHasher::new();
    t.hash(&mut s);
    s.finish()
}

/// Returns the formatted hash of the given input as hexadecimal digits
pub fn hexdigest<T: Hash>(t: &T) -> String {
    let h = calculate_hash(t);
    format!("{h:016x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hexdigest_is_stable_for_equal_inputs() {
        let a = hexdigest(&("some/mapped/file", 0x1000_usize));
        let b = hexdigest(&("some/mapped/file", 0x1000_usize));
        let c = hexdigest(&("some/mapped/file", 0x2000_usize));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }
}
