//! A full set of VRPs at one point in time.

use std::collections::BTreeSet;
use std::ops::Deref;

use crate::vrp::Vrp;


//------------ VrpSet -----------------------------------------------------------

/// A complete, deduplicated, ordered set of VRPs.
///
/// This is the `current` half of [`super::history::History`] — what a
/// Cache Reset sends in full, and what delta construction diffs against.
/// It's a plain ordered set rather than routinator's multi-payload-kind
/// snapshot since this system only ever serves route origins.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VrpSet(BTreeSet<Vrp>);

impl VrpSet {
    pub fn new() -> Self {
        VrpSet(BTreeSet::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vrp> {
        self.0.iter()
    }

    pub fn insert(&mut self, vrp: Vrp) -> bool {
        self.0.insert(vrp)
    }

    pub fn v4_count(&self) -> usize {
        self.0.iter().filter(|vrp| vrp.is_v4()).count()
    }

    pub fn v6_count(&self) -> usize {
        self.0.len() - self.v4_count()
    }
}

impl Deref for VrpSet {
    type Target = BTreeSet<Vrp>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromIterator<Vrp> for VrpSet {
    fn from_iter<I: IntoIterator<Item = Vrp>>(iter: I) -> Self {
        VrpSet(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a VrpSet {
    type Item = &'a Vrp;
    type IntoIter = std::collections::btree_set::Iter<'a, Vrp>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::vrp::Prefix;
    use std::str::FromStr;

    fn vrp(prefix: &str, asn: u32, max: u8) -> Vrp {
        Vrp::new(Prefix::from_str(prefix).unwrap(), asn, max).unwrap()
    }

    #[test]
    fn dedups_identical_entries() {
        let mut set = VrpSet::new();
        assert!(set.insert(vrp("10.0.0.0/24", 1, 24)));
        assert!(!set.insert(vrp("10.0.0.0/24", 1, 24)));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn counts_by_family() {
        let set: VrpSet = vec![
            vrp("10.0.0.0/24", 1, 24),
            vrp("2001:db8::/32", 1, 32),
            vrp("2001:db8::/32", 2, 32),
        ].into_iter().collect();
        assert_eq!(set.v4_count(), 1);
        assert_eq!(set.v6_count(), 2);
    }
}
