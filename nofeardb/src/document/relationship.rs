use super::DocHandle;
use std::fmt;

/// Cardinality of a relationship, seen from the side that declares it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationshipKind {
    ManyToOne,
    OneToMany,
    ManyToMany,
}

impl RelationshipKind {
    /// Whether the declaring side holds a list rather than a single slot.
    pub fn is_collection(self) -> bool {
        !matches!(self, RelationshipKind::ManyToOne)
    }

    /// The cardinality the opposite side must declare for the pair to be consistent.
    pub fn inverse(self) -> RelationshipKind {
        match self {
            RelationshipKind::ManyToOne => RelationshipKind::OneToMany,
            RelationshipKind::OneToMany => RelationshipKind::ManyToOne,
            RelationshipKind::ManyToMany => RelationshipKind::ManyToMany,
        }
    }
}

impl fmt::Display for RelationshipKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RelationshipKind::ManyToOne => "many-to-one",
            RelationshipKind::OneToMany => "one-to-many",
            RelationshipKind::ManyToMany => "many-to-many",
        };
        f.write_str(name)
    }
}

/// Type-erased access to a relationship slot.
///
/// The raw mutators do not track changes or back-populate; graph-level operations on
/// [`DocumentGraph`](super::DocumentGraph) wrap them with that bookkeeping.
pub trait PersistableRelationship: Send {
    fn name(&self) -> &'static str;

    fn kind(&self) -> RelationshipKind;

    /// Type name of the related documents.
    fn target(&self) -> &'static str;

    /// Name of the mirrored relationship on the target type, if bidirectional.
    fn back_populates(&self) -> Option<&'static str>;

    fn related(&self) -> Vec<DocHandle>;

    fn contains(&self, item: DocHandle) -> bool {
        self.related().contains(&item)
    }

    #[doc(hidden)]
    fn attach(&mut self, item: DocHandle);

    #[doc(hidden)]
    fn insert_at(&mut self, index: usize, item: DocHandle);

    #[doc(hidden)]
    fn detach(&mut self, item: DocHandle) -> bool;

    fn create_snapshot(&mut self);

    fn reset(&mut self);
}

#[derive(Debug, Clone)]
struct Descriptor {
    name: &'static str,
    target: &'static str,
    back_populates: Option<&'static str>,
}

/// Ordered membership list shared by the to-many relationship kinds.
#[derive(Debug, Clone, Default)]
struct RelatedList {
    items: Vec<DocHandle>,
    snapshot: Option<Vec<DocHandle>>,
}

impl RelatedList {
    fn attach(&mut self, item: DocHandle) {
        if !self.items.contains(&item) {
            self.items.push(item);
        }
    }

    fn insert_at(&mut self, index: usize, item: DocHandle) {
        if !self.items.contains(&item) {
            let index = index.min(self.items.len());
            self.items.insert(index, item);
        }
    }

    fn detach(&mut self, item: DocHandle) -> bool {
        match self.items.iter().position(|h| *h == item) {
            Some(pos) => {
                self.items.remove(pos);
                true
            }
            None => false,
        }
    }

    fn create_snapshot(&mut self) {
        self.snapshot = Some(self.items.clone());
    }

    fn reset(&mut self) {
        if let Some(saved) = &self.snapshot {
            self.items = saved.clone();
        }
    }
}

macro_rules! to_many_relationship {
    ($(#[$doc:meta])* $ty:ident, $kind:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone)]
        pub struct $ty {
            descriptor: Descriptor,
            list: RelatedList,
        }

        impl $ty {
            pub fn new(name: &'static str, target: &'static str) -> Self {
                $ty {
                    descriptor: Descriptor {
                        name,
                        target,
                        back_populates: None,
                    },
                    list: RelatedList::default(),
                }
            }

            /// Mirror every mutation onto the named relationship of the target type.
            pub fn back_populates(mut self, name: &'static str) -> Self {
                self.descriptor.back_populates = Some(name);
                self
            }

            pub fn items(&self) -> &[DocHandle] {
                &self.list.items
            }

            pub fn get(&self, index: usize) -> Option<DocHandle> {
                self.list.items.get(index).copied()
            }

            pub fn len(&self) -> usize {
                self.list.items.len()
            }

            pub fn is_empty(&self) -> bool {
                self.list.items.is_empty()
            }

            pub fn iter(&self) -> impl Iterator<Item = DocHandle> + '_ {
                self.list.items.iter().copied()
            }
        }

        impl PersistableRelationship for $ty {
            fn name(&self) -> &'static str {
                self.descriptor.name
            }

            fn kind(&self) -> RelationshipKind {
                $kind
            }

            fn target(&self) -> &'static str {
                self.descriptor.target
            }

            fn back_populates(&self) -> Option<&'static str> {
                self.descriptor.back_populates
            }

            fn related(&self) -> Vec<DocHandle> {
                self.list.items.clone()
            }

            fn contains(&self, item: DocHandle) -> bool {
                self.list.items.contains(&item)
            }

            fn attach(&mut self, item: DocHandle) {
                self.list.attach(item);
            }

            fn insert_at(&mut self, index: usize, item: DocHandle) {
                self.list.insert_at(index, item);
            }

            fn detach(&mut self, item: DocHandle) -> bool {
                self.list.detach(item)
            }

            fn create_snapshot(&mut self) {
                self.list.create_snapshot();
            }

            fn reset(&mut self) {
                self.list.reset();
            }
        }
    };
}

to_many_relationship!(
    /// The "one" side of a one-to-many relationship: an ordered list of related documents.
    OneToMany,
    RelationshipKind::OneToMany
);

to_many_relationship!(
    /// One side of a many-to-many relationship.
    ManyToMany,
    RelationshipKind::ManyToMany
);

/// The "many" side of a one-to-many relationship: at most one related document.
#[derive(Debug, Clone)]
pub struct ManyToOne {
    descriptor: Descriptor,
    slot: Option<DocHandle>,
    snapshot: Option<Option<DocHandle>>,
}

impl ManyToOne {
    pub fn new(name: &'static str, target: &'static str) -> Self {
        ManyToOne {
            descriptor: Descriptor {
                name,
                target,
                back_populates: None,
            },
            slot: None,
            snapshot: None,
        }
    }

    pub fn back_populates(mut self, name: &'static str) -> Self {
        self.descriptor.back_populates = Some(name);
        self
    }

    pub fn get(&self) -> Option<DocHandle> {
        self.slot
    }
}

impl PersistableRelationship for ManyToOne {
    fn name(&self) -> &'static str {
        self.descriptor.name
    }

    fn kind(&self) -> RelationshipKind {
        RelationshipKind::ManyToOne
    }

    fn target(&self) -> &'static str {
        self.descriptor.target
    }

    fn back_populates(&self) -> Option<&'static str> {
        self.descriptor.back_populates
    }

    fn related(&self) -> Vec<DocHandle> {
        self.slot.into_iter().collect()
    }

    fn contains(&self, item: DocHandle) -> bool {
        self.slot == Some(item)
    }

    fn attach(&mut self, item: DocHandle) {
        self.slot = Some(item);
    }

    fn insert_at(&mut self, _index: usize, item: DocHandle) {
        self.slot = Some(item);
    }

    fn detach(&mut self, item: DocHandle) -> bool {
        if self.slot == Some(item) {
            self.slot = None;
            return true;
        }
        false
    }

    fn create_snapshot(&mut self) {
        self.snapshot = Some(self.slot);
    }

    fn reset(&mut self) {
        if let Some(saved) = self.snapshot {
            self.slot = saved;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_ignores_duplicates() {
        let mut rel = OneToMany::new("items", "Item");
        rel.attach(DocHandle(1));
        rel.attach(DocHandle(2));
        rel.attach(DocHandle(1));
        assert_eq!(rel.items(), [DocHandle(1), DocHandle(2)]);
    }

    #[test]
    fn test_insert_at_keeps_position() {
        let mut rel = ManyToMany::new("tags", "Tag");
        rel.attach(DocHandle(1));
        rel.attach(DocHandle(2));
        rel.detach(DocHandle(1));
        rel.insert_at(0, DocHandle(3));
        assert_eq!(rel.items(), [DocHandle(3), DocHandle(2)]);
    }

    #[test]
    fn test_many_to_one_slot() {
        let mut rel = ManyToOne::new("owner", "Owner").back_populates("items");
        assert_eq!(PersistableRelationship::back_populates(&rel), Some("items"));
        rel.attach(DocHandle(5));
        assert!(rel.contains(DocHandle(5)));
        assert!(!rel.detach(DocHandle(6)));
        assert!(rel.detach(DocHandle(5)));
        assert_eq!(rel.get(), None);
    }

    #[test]
    fn test_snapshot_reset() {
        let mut rel = OneToMany::new("items", "Item");
        rel.attach(DocHandle(1));
        rel.create_snapshot();
        rel.attach(DocHandle(2));
        rel.reset();
        assert_eq!(rel.related(), vec![DocHandle(1)]);
    }

    #[test]
    fn test_inverse_kinds() {
        assert_eq!(RelationshipKind::ManyToOne.inverse(), RelationshipKind::OneToMany);
        assert_eq!(RelationshipKind::ManyToMany.inverse(), RelationshipKind::ManyToMany);
        assert!(!RelationshipKind::ManyToOne.is_collection());
    }
}
