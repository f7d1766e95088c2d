/// Exact byte signature.
#[derive(Clone, Debug)]
pub struct Signature {
    bytes: Vec<u8>,
}

impl Signature {
    /// Matches a complete C string: the literal, its terminator, and a
    /// terminator (or section start) in front of it.
    pub fn c_string(literal: &str) -> Self {
        let mut bytes = Vec::with_capacity(literal.len() + 2);
        bytes.push(0);
        bytes.extend_from_slice(literal.as_bytes());
        bytes.push(0);

        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Offset of the first match in `buf`.
    pub fn find_in(&self, buf: &[u8]) -> Option<usize> {
        if self.is_empty() || buf.len() < self.len() {
            return None;
        }

        buf.windows(self.len()).position(|w| self == &w)
    }
}

impl PartialEq<&[u8]> for Signature {
    fn eq(&self, other: &&[u8]) -> bool {
        self.bytes.as_slice() == *other
    }
}

impl PartialEq<Signature> for &[u8] {
    fn eq(&self, other: &Signature) -> bool {
        other.eq(self)
    }
}
