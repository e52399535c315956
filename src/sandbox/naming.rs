use std::path::Path;

use rand::Rng;
use sha2::{Digest, Sha256};

/// Every instance created by this crate carries this prefix, so leftovers can be found.
pub const INSTANCE_PREFIX: &str = "c4arena_";

/// A fresh instance name for `artifact`: prefix, artifact hash, random suffix.
///
/// The hash groups instances of the same agent; the suffix keeps concurrent instances of the
/// same artifact apart.
pub fn instance_name(artifact: &Path) -> String {
    let digest = Sha256::digest(artifact.as_os_str().as_encoded_bytes());
    let hash = digest
        .iter()
        .take(6)
        .map(|b| format!("{b:02x}"))
        .collect::<String>();
    let suffix: u64 = rand::thread_rng().gen();
    format!("{INSTANCE_PREFIX}{hash}_{suffix:016x}")
}

/// True for names produced by [`instance_name`].
pub fn is_managed(name: &str) -> bool {
    name.starts_with(INSTANCE_PREFIX)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn same_artifact_never_collides() {
        let artifact = Path::new("/agents/random.sif");
        let names = (0..1000)
            .map(|_| instance_name(artifact))
            .collect::<HashSet<_>>();
        assert_eq!(names.len(), 1000);
    }

    #[test]
    fn names_share_the_artifact_hash() {
        let a = instance_name(Path::new("/agents/a.sif"));
        let a2 = instance_name(Path::new("/agents/a.sif"));
        let b = instance_name(Path::new("/agents/b.sif"));
        let hash = |n: &str| n.split('_').nth(1).unwrap().to_string();
        assert_eq!(hash(&a), hash(&a2));
        assert_ne!(hash(&a), hash(&b));
        assert!(is_managed(&a));
        assert!(a
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_'));
    }
}
