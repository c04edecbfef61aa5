//! Small GF(2) linear algebra over u64 bit vectors, enough to classify
//! flip vectors against a set of sample signatures.

/// A basis in row echelon form.  Row `i` (if present) has its leading one
/// at a distinct position, kept sorted descending by leading bit.
#[derive(Debug, Default, Clone)]
pub struct Gf2Basis {
    rows: Vec<u64>,
}

impl Gf2Basis {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vectors(vectors: impl IntoIterator<Item = u64>) -> Self {
        let mut basis = Self::new();
        for v in vectors {
            basis.insert(v);
        }
        basis
    }

    /// Reduce `v` against the basis, returning the remainder.  Zero means
    /// `v` is in the span.
    pub fn reduce(&self, mut v: u64) -> u64 {
        for &row in &self.rows {
            let lead = 1u64 << (63 - row.leading_zeros());
            if v & lead != 0 {
                v ^= row;
            }
        }
        v
    }

    /// Add `v` to the basis.  Returns false if `v` was already in the span.
    pub fn insert(&mut self, v: u64) -> bool {
        let rem = self.reduce(v);
        if rem == 0 {
            return false;
        }
        let pos = self
            .rows
            .partition_point(|&row| row.leading_zeros() < rem.leading_zeros());
        self.rows.insert(pos, rem);
        true
    }

    pub fn contains(&self, v: u64) -> bool {
        self.reduce(v) == 0
    }

    pub fn rank(&self) -> usize {
        self.rows.len()
    }
}
