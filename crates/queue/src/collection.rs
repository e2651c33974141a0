//! Batches returned by `multi_get`.
//!
//! A collection is an ordered run of packages handed to one consumer from a
//! single pipelined fetch. Members share one bitset recording which slots
//! have left the working list; `multi_ack` and the reject guards consult it.

use std::ops::Index;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::error::Result;
use crate::package::{Package, PackageCtx};

/// Links a package to its batch: the shared removal bitset and its slot.
#[derive(Clone)]
pub(crate) struct BatchRef {
    pub(crate) bits: Arc<Vec<AtomicBool>>,
    pub(crate) index: usize,
}

pub struct Collection {
    packages: Vec<Package>,
}

impl Collection {
    pub(crate) fn empty() -> Self {
        Self { packages: Vec::new() }
    }

    pub(crate) fn from_wires(wires: &[String], ctx: &Arc<PackageCtx>) -> Result<Self> {
        let bits: Arc<Vec<AtomicBool>> =
            Arc::new(wires.iter().map(|_| AtomicBool::new(false)).collect());
        let packages = wires
            .iter()
            .enumerate()
            .map(|(index, wire)| {
                Package::from_wire(wire, ctx.clone()).map(|package| {
                    package.into_batch(BatchRef {
                        bits: bits.clone(),
                        index,
                    })
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { packages })
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Package> {
        self.packages.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Package> {
        self.packages.iter()
    }
}

impl Index<usize> for Collection {
    type Output = Package;

    fn index(&self, index: usize) -> &Package {
        &self.packages[index]
    }
}

impl<'a> IntoIterator for &'a Collection {
    type Item = &'a Package;
    type IntoIter = std::slice::Iter<'a, Package>;

    fn into_iter(self) -> Self::IntoIter {
        self.packages.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_collection() {
        let collection = Collection::empty();
        assert_eq!(collection.len(), 0);
        assert!(collection.is_empty());
        assert!(collection.get(0).is_none());
    }
}
