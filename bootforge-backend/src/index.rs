// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sorted, searchable projections of an entity set on a named field.
//!
//! A [`Maker`] bundles everything needed to work with one indexed field: a
//! total order, a builder that turns a reference entity into the pair of
//! half-open range tests `(gte, gt)`, and a parser that builds a reference
//! entity from a query string.  An [`Index`] is just a sorted snapshot;
//! every range operation returns a narrowed Index, so queries compose by
//! chaining.

use std::cmp::Ordering;
use std::sync::Arc;

use bootforge_common::{Error, ErrorKind};

use crate::model::Entity;

/// A monotonic predicate over entities in index order.
pub type Test = Box<dyn Fn(&dyn Entity) -> bool>;

type LessFn = Box<dyn Fn(&dyn Entity, &dyn Entity) -> bool>;
type TestsFn = Box<dyn Fn(&dyn Entity) -> (Test, Test)>;
type FillFn = Box<dyn Fn(&str) -> Result<Box<dyn Entity>, Error>>;

/// Everything needed to build and query an index on one field.
pub struct Maker {
    /// Whether two distinct entities may share a value on this field.
    pub unique: bool,
    /// Human-readable type of the indexed field, for query errors.
    pub kind: &'static str,
    less: LessFn,
    tests: TestsFn,
    fill: Option<FillFn>,
}

impl Maker {
    pub fn new<L, T, F>(
        unique: bool,
        kind: &'static str,
        less: L,
        tests: T,
        fill: F,
    ) -> Maker
    where
        L: Fn(&dyn Entity, &dyn Entity) -> bool + 'static,
        T: Fn(&dyn Entity) -> (Test, Test) + 'static,
        F: Fn(&str) -> Result<Box<dyn Entity>, Error> + 'static,
    {
        Maker {
            unique,
            kind,
            less: Box::new(less),
            tests: Box::new(tests),
            fill: Some(Box::new(fill)),
        }
    }

    /// The index every entity has: its own key.  This maker has no parser;
    /// key lookups go through the store directly.
    pub fn key() -> Maker {
        Maker {
            unique: true,
            kind: "string",
            less: Box::new(|i, j| i.key() < j.key()),
            tests: Box::new(|r| {
                let gte_key = r.key();
                let gt_key = r.key();
                (
                    Box::new(move |s: &dyn Entity| s.key() >= gte_key),
                    Box::new(move |s: &dyn Entity| s.key() > gt_key),
                )
            }),
            fill: None,
        }
    }

    /// Builds the `(gte, gt)` range tests anchored at `at`.
    pub fn tests(&self, at: &dyn Entity) -> (Test, Test) {
        (self.tests)(at)
    }

    /// Parses a query string into a reference entity for range tests.
    pub fn fill(&self, s: &str) -> Result<Box<dyn Entity>, Error> {
        match &self.fill {
            Some(f) => f(s),
            None => {
                let mut e = Error::new(ErrorKind::Validation);
                e.add(format!("index has no value parser (want {})", self.kind));
                Err(e)
            }
        }
    }

    fn ordering(&self, a: &dyn Entity, b: &dyn Entity) -> Ordering {
        if (self.less)(a, b) {
            Ordering::Less
        } else if (self.less)(b, a) {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }

    /// Sorts `items` into an [`Index`] on this field.
    pub fn index(&self, mut items: Vec<Arc<dyn Entity>>) -> Index {
        items.sort_by(|a, b| self.ordering(&**a, &**b));
        Index { items }
    }
}

/// A sorted snapshot of entities, narrowable by range operations.
pub struct Index {
    items: Vec<Arc<dyn Entity>>,
}

impl Index {
    pub fn items(&self) -> &[Arc<dyn Entity>] {
        &self.items
    }

    pub fn into_items(self) -> Vec<Arc<dyn Entity>> {
        self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn cut(&self, test: &Test) -> usize {
        // `test` is monotonic in index order, so this is the index of the
        // first item satisfying it.
        self.items.partition_point(|i| !test(&**i))
    }

    pub fn lt(&self, maker: &Maker, at: &dyn Entity) -> Index {
        let (gte, _) = maker.tests(at);
        Index { items: self.items[..self.cut(&gte)].to_vec() }
    }

    pub fn lte(&self, maker: &Maker, at: &dyn Entity) -> Index {
        let (_, gt) = maker.tests(at);
        Index { items: self.items[..self.cut(&gt)].to_vec() }
    }

    pub fn gte(&self, maker: &Maker, at: &dyn Entity) -> Index {
        let (gte, _) = maker.tests(at);
        Index { items: self.items[self.cut(&gte)..].to_vec() }
    }

    pub fn gt(&self, maker: &Maker, at: &dyn Entity) -> Index {
        let (_, gt) = maker.tests(at);
        Index { items: self.items[self.cut(&gt)..].to_vec() }
    }

    pub fn eq(&self, maker: &Maker, at: &dyn Entity) -> Index {
        let (gte, gt) = maker.tests(at);
        let lo = self.cut(&gte);
        let hi = self.cut(&gt);
        Index { items: self.items[lo..hi].to_vec() }
    }

    pub fn between(&self, maker: &Maker, lo: &dyn Entity, hi: &dyn Entity) -> Index {
        self.gte(maker, lo).lte(maker, hi)
    }

    /// Everything except the items equal to `at` on this field.
    pub fn except(&self, maker: &Maker, at: &dyn Entity) -> Index {
        let (gte, gt) = maker.tests(at);
        let lo = self.cut(&gte);
        let hi = self.cut(&gt);
        let mut items = self.items[..lo].to_vec();
        items.extend_from_slice(&self.items[hi..]);
        Index { items }
    }
}

/// Verifies that `obj` does not collide with any other item on a unique
/// index, failing with a 422 that names the offending field.
pub fn check_unique(
    obj: &dyn Entity,
    items: &[Arc<dyn Entity>],
) -> Result<(), Error> {
    let mut e = Error::validation(obj.prefix(), &obj.key());
    for (name, maker) in obj.indexes() {
        if !maker.unique {
            continue;
        }
        let (gte, gt) = maker.tests(obj);
        for item in items {
            if item.key() == obj.key() {
                continue;
            }
            if gte(&**item) && !gt(&**item) {
                e.add(format!(
                    "Duplicate value on unique index {} (held by {})",
                    name,
                    item.key()
                ));
            }
        }
    }
    e.or_ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{Machine, MACHINES};
    use std::net::Ipv4Addr;

    fn machines() -> Vec<Arc<dyn Entity>> {
        ["m1.example.com", "m3.example.com", "m2.example.com"]
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let mut m = Machine::new(name);
                m.address = Some(Ipv4Addr::new(10, 0, 0, (i + 1) as u8));
                Arc::new(m) as Arc<dyn Entity>
            })
            .collect()
    }

    fn name_maker() -> Maker {
        let ms = machines();
        let anchor: Arc<dyn Entity> = ms[0].clone();
        // Pull a real maker definition off an entity.
        anchor
            .indexes()
            .into_iter()
            .find(|(n, _)| *n == "Name")
            .map(|(_, m)| m)
            .unwrap()
    }

    fn names(idx: &Index) -> Vec<String> {
        idx.items()
            .iter()
            .map(|i| crate::model::as_machine(&**i).name.clone())
            .collect()
    }

    #[test]
    fn test_sort_and_ranges() {
        let maker = name_maker();
        let idx = maker.index(machines());
        assert_eq!(
            names(&idx),
            vec!["m1.example.com", "m2.example.com", "m3.example.com"]
        );

        let at = maker.fill("m2.example.com").unwrap();
        assert_eq!(names(&idx.lt(&maker, &*at)), vec!["m1.example.com"]);
        assert_eq!(
            names(&idx.lte(&maker, &*at)),
            vec!["m1.example.com", "m2.example.com"]
        );
        assert_eq!(names(&idx.gt(&maker, &*at)), vec!["m3.example.com"]);
        assert_eq!(names(&idx.eq(&maker, &*at)), vec!["m2.example.com"]);
        assert_eq!(
            names(&idx.except(&maker, &*at)),
            vec!["m1.example.com", "m3.example.com"]
        );

        let lo = maker.fill("m2.example.com").unwrap();
        let hi = maker.fill("m3.example.com").unwrap();
        assert_eq!(
            names(&idx.between(&maker, &*lo, &*hi)),
            vec!["m2.example.com", "m3.example.com"]
        );
    }

    #[test]
    fn test_composition_narrows() {
        let maker = name_maker();
        let idx = maker.index(machines());
        let lo = maker.fill("m1.example.com").unwrap();
        let narrowed = idx.gt(&maker, &*lo).lt(
            &maker,
            &*maker.fill("m3.example.com").unwrap(),
        );
        assert_eq!(names(&narrowed), vec!["m2.example.com"]);
    }

    #[test]
    fn test_check_unique() {
        let items = machines();
        let mut dup = Machine::new("m2.example.com");
        dup.address = Some(Ipv4Addr::new(10, 0, 0, 9));
        let err = check_unique(&dup, &items).unwrap_err();
        assert_eq!(err.code, 422);
        assert!(
            err.messages.iter().any(|m| m.contains("Name")),
            "messages: {:?}",
            err.messages
        );

        let fresh = Machine::new("m4.example.com");
        check_unique(&fresh, &items).unwrap();
        assert_eq!(fresh.prefix(), MACHINES);
    }
}
