use std::collections::BTreeMap;

use crate::num_util::Postincrement;
use crate::state::{TagID, TagInstance, TagRef};

/// Logical views only exist once some tag name has been seen twice.
#[derive(Debug)]
enum TagViews {
    PhysicalOnly,
    PhysicalPlusLogical(Vec<TagInstance>),
}

/// Physical tags in discovery order, and (when names repeat) logical tags
/// that merge every physical tag sharing a name.
#[derive(Debug)]
pub struct TagRegistry {
    num_locales: usize,
    // [TagAll, TagStart, physical...]
    instances: Vec<TagInstance>,
    tag_numbers: BTreeMap<u32, TagID>,
    names: BTreeMap<String, usize>,
    name_order: Vec<String>,
    next_tag: u32,
    views: TagViews,
}

const RESERVED: usize = 2;

fn slot(tag: TagRef) -> usize {
    match tag {
        TagRef::All => 0,
        TagRef::Start => 1,
        TagRef::Tag(TagID(index)) => index as usize + RESERVED,
    }
}

impl TagRegistry {
    pub fn new(num_locales: usize) -> Self {
        TagRegistry {
            num_locales,
            instances: vec![
                TagInstance::new("All".to_owned(), num_locales),
                TagInstance::new("Start".to_owned(), num_locales),
            ],
            tag_numbers: BTreeMap::new(),
            names: BTreeMap::new(),
            name_order: Vec::new(),
            next_tag: 0,
            views: TagViews::PhysicalOnly,
        }
    }

    /// Physical tag for a runtime tag number, if one has started.
    pub fn tag_id(&self, tag_no: u32) -> Option<TagID> {
        self.tag_numbers.get(&tag_no).copied()
    }

    /// Registers a tag start, returning the physical tag. A tag number seen
    /// before keeps its original tag.
    pub(crate) fn start(&mut self, tag_no: u32, name: &str) -> TagID {
        if let Some(tag_id) = self.tag_id(tag_no) {
            return tag_id;
        }
        let tag_id = TagID(self.next_tag.postincrement());
        self.tag_numbers.insert(tag_no, tag_id);
        let mut instance = TagInstance::new(name.to_owned(), self.num_locales);
        instance.tag_no = Some(tag_no);
        self.instances.push(instance);

        let uses = self.names.entry(name.to_owned()).or_insert(0);
        if *uses == 0 {
            self.name_order.push(name.to_owned());
        } else if let TagViews::PhysicalOnly = self.views {
            self.views = TagViews::PhysicalPlusLogical(Vec::new());
        }
        *uses += 1;
        tag_id
    }

    pub(crate) fn instance(&self, tag: TagRef) -> &TagInstance {
        &self.instances[slot(tag)]
    }

    pub(crate) fn instance_mut(&mut self, tag: TagRef) -> &mut TagInstance {
        &mut self.instances[slot(tag)]
    }

    /// Computes every tag's extrema and builds the logical views.
    pub(crate) fn finish(&mut self) {
        for instance in &mut self.instances {
            instance.finalize();
        }
        if let TagViews::PhysicalPlusLogical(logical) = &mut self.views {
            logical.clear();
            for name in &self.name_order {
                let mut merged = TagInstance::new(name.clone(), self.num_locales);
                for physical in self.instances[RESERVED..]
                    .iter()
                    .filter(|t| t.name == *name)
                {
                    merged.merge(physical);
                }
                merged.finalize();
                logical.push(merged);
            }
        }
    }

    pub fn get(&self, tag: TagRef) -> Option<&TagInstance> {
        self.instances.get(slot(tag))
    }

    /// Logical views: `All` and `Start` are the reserved tags themselves.
    /// `None` for discovered tags when every name is unique.
    pub fn get_logical(&self, tag: TagRef) -> Option<&TagInstance> {
        match (tag, &self.views) {
            (TagRef::All | TagRef::Start, _) => self.get(tag),
            (TagRef::Tag(_), TagViews::PhysicalOnly) => None,
            (TagRef::Tag(TagID(index)), TagViews::PhysicalPlusLogical(logical)) => {
                logical.get(index as usize)
            }
        }
    }

    pub fn tag_count(&self) -> usize {
        self.instances.len() - RESERVED
    }

    pub fn logical_tag_count(&self) -> usize {
        self.name_order.len()
    }

    pub fn has_unique_tags(&self) -> bool {
        matches!(self.views, TagViews::PhysicalOnly)
    }

    /// Discovered tags in index order.
    pub fn iter(&self) -> impl Iterator<Item = (TagRef, &TagInstance)> {
        self.instances[RESERVED..]
            .iter()
            .enumerate()
            .map(|(index, instance)| (TagRef::Tag(TagID(index as u32)), instance))
    }

    pub fn iter_logical(&self) -> impl Iterator<Item = (TagRef, &TagInstance)> {
        let logical: &[TagInstance] = match &self.views {
            TagViews::PhysicalOnly => &[],
            TagViews::PhysicalPlusLogical(logical) => logical,
        };
        logical
            .iter()
            .enumerate()
            .map(|(index, instance)| (TagRef::Tag(TagID(index as u32)), instance))
    }
}
