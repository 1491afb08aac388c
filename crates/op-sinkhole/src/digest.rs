use ring::digest::{Context, SHA256};

/// SHA-256 of a rendered artifact, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest(String);

impl Digest {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.0
    }
}

/// Hash rendered bytes. Renderers sort their input, so equal policies hash equal.
pub fn hash(artifact: &[u8]) -> Digest {
    hash_parts(&[artifact])
}

/// Hash several artifacts as one, each length-prefixed so boundaries count.
pub fn hash_parts(parts: &[&[u8]]) -> Digest {
    let mut context = Context::new(&SHA256);
    for part in parts {
        context.update(&(part.len() as u64).to_be_bytes());
        context.update(part);
    }
    Digest(hex::encode(context.finish().as_ref()))
}

/// Whether `current` differs from the last persisted digest.
pub fn changed(previous: Option<&str>, current: &Digest) -> bool {
    previous != Some(current.as_str())
}
