//! Audience segmentation over subscriber tags.
//!
//! Segments form a tree stored with a materialized path. A segment keeps the
//! subscribers carrying all of its tags (or, negated, none of them) and then
//! narrows further by every child. Several segments given to
//! [`get_subscribers`] are unioned.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use rand::seq::SliceRandom;

use crate::db::{Changeset, Collectable, Database, Id, Identifiable};
use crate::{Error, Result};

use super::{active_subscribers, Subscriber};

/// Prefix of the tags written by [`generate_random_split`].
pub const RANDOM_TAG_PREFIX: &str = "random:";

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Segment {
    pub id: Id,
    pub name: String,
    pub newsletter: Option<Id>,
    pub parent: Option<Id>,
    /// `/<root id>/.../<own id>/`
    pub path: String,
    pub tags: BTreeSet<String>,
    pub negate: bool,
    pub created: DateTime<Utc>,
}

impl Default for Segment {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            newsletter: None,
            parent: None,
            path: String::new(),
            tags: BTreeSet::new(),
            negate: false,
            created: Utc::now(),
        }
    }
}

impl Collectable for Segment {
    fn get_collection_name() -> &'static str {
        "segments"
    }
}

impl Identifiable for Segment {
    fn get_id(&self) -> Id {
        self.id
    }
}

impl Segment {
    pub fn new(db: &Database, name: &str) -> Result<Self> {
        let id = db.generate_id()?;
        Ok(Self {
            id,
            name: name.to_string(),
            path: format!("/{id}/"),
            ..Default::default()
        })
    }

    pub fn child_of(db: &Database, parent: &Segment, name: &str) -> Result<Self> {
        let id = db.generate_id()?;
        Ok(Self {
            id,
            name: name.to_string(),
            newsletter: parent.newsletter,
            parent: Some(parent.id),
            path: format!("{}{id}/", parent.path),
            ..Default::default()
        })
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn negated(mut self) -> Self {
        self.negate = true;
        self
    }

    /// Own tag condition, children not considered.
    pub fn matches_tags(&self, subscriber: &Subscriber) -> bool {
        if self.negate {
            self.tags.iter().all(|t| !subscriber.tags.contains(t))
        } else {
            self.tags.iter().all(|t| subscriber.tags.contains(t))
        }
    }

    pub fn depth(&self) -> usize {
        self.path.trim_matches('/').split('/').count()
    }
}

/// Children index over all stored segments.
pub struct SegmentTree {
    segments: FnvHashMap<Id, Segment>,
    children: FnvHashMap<Id, Vec<Id>>,
}

impl SegmentTree {
    pub fn load(db: &Database) -> Result<Self> {
        let mut segments = FnvHashMap::default();
        let mut children: FnvHashMap<Id, Vec<Id>> = FnvHashMap::default();
        for segment in db.get_collection::<Segment>()? {
            if let Some(parent) = segment.parent {
                children.entry(parent).or_default().push(segment.id);
            }
            segments.insert(segment.id, segment);
        }
        for ids in children.values_mut() {
            ids.sort_unstable();
        }
        Ok(Self { segments, children })
    }

    pub fn get(&self, id: Id) -> Option<&Segment> {
        self.segments.get(&id)
    }

    pub fn children(&self, id: Id) -> impl Iterator<Item = &Segment> {
        self.children
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(|c| self.segments.get(c))
    }

    /// Whether the subscriber passes the segment and all of its children.
    pub fn matches(&self, segment: &Segment, subscriber: &Subscriber) -> bool {
        segment.matches_tags(subscriber)
            && self
                .children(segment.id)
                .all(|child| self.matches(child, subscriber))
    }

    pub fn filter(&self, segment: &Segment, subscribers: Vec<Subscriber>) -> Vec<Subscriber> {
        subscribers
            .into_iter()
            .filter(|s| self.matches(segment, s))
            .collect()
    }
}

/// Confirmed subscribers of the newsletter within the union of the given
/// segments, all of them when no segment is given. Sorted by id.
pub fn get_subscribers(db: &Database, newsletter: Id, segments: &[Id]) -> Result<Vec<Subscriber>> {
    let subscribers = active_subscribers(db, newsletter)?;
    if segments.is_empty() {
        return Ok(subscribers);
    }
    let tree = SegmentTree::load(db)?;
    let roots = segments
        .iter()
        .map(|id| {
            tree.get(*id)
                .ok_or_else(|| Error::not_found(format!("segment {id}")))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut selected = BTreeMap::new();
    for subscriber in subscribers {
        if roots.iter().any(|root| tree.matches(root, &subscriber)) {
            selected.insert(subscriber.id, subscriber);
        }
    }
    Ok(selected.into_values().collect())
}

/// `A`, `B`, .. `Z`, `AA`, `AB`, ..
fn group_letter(mut index: usize) -> String {
    let mut letters = vec![];
    loop {
        letters.push((b'A' + (index % 26) as u8) as char);
        if index < 26 {
            break;
        }
        index = index / 26 - 1;
    }
    letters.iter().rev().collect()
}

fn split_tag(name: &str, share: u32, letter: &str) -> String {
    format!("{RANDOM_TAG_PREFIX}{name}:{share}%:{letter}")
}

/// Draws disjoint random groups from the audience and tags them.
///
/// `groups` are percentages of the eligible population, summing to at most
/// 100. Subscribers already assigned by an earlier split of the same name
/// are not eligible again, and new groups continue the lettering. Returns
/// one segment per group selecting exactly its members.
pub fn generate_random_split(
    db: &Database,
    name: &str,
    newsletter: Id,
    segments: &[Id],
    groups: &[u32],
) -> Result<Vec<Segment>> {
    if name.is_empty() || name.contains(':') {
        return Err(Error::bad_input("split name must be non-empty without ':'"));
    }
    if groups.is_empty() || groups.iter().any(|g| *g == 0) {
        return Err(Error::bad_input("group shares must be positive"));
    }
    if groups.iter().sum::<u32>() > 100 {
        return Err(Error::bad_input("group shares exceed 100%"));
    }

    let prefix = format!("{RANDOM_TAG_PREFIX}{name}:");
    let mut population: Vec<Subscriber> = get_subscribers(db, newsletter, segments)?
        .into_iter()
        .filter(|s| !s.tags.iter().any(|t| t.starts_with(&prefix)))
        .collect();

    let existing_groups = db
        .filter::<Segment, _>(|s| s.tags.iter().any(|t| t.starts_with(&prefix)))?
        .len();

    let total = population.len();
    let sizes: Vec<usize> = groups
        .iter()
        .map(|g| (total as f64 * *g as f64 / 100.0).round() as usize)
        .collect();
    let drawn = sizes.iter().sum::<usize>().min(total);

    population.shuffle(&mut rand::thread_rng());
    population.truncate(drawn);

    let mut changes = Changeset::new();
    let mut created = vec![];
    let mut members = population.into_iter();
    for (i, (share, size)) in groups.iter().zip(sizes).enumerate() {
        let letter = group_letter(existing_groups + i);
        let tag = split_tag(name, *share, &letter);
        for mut subscriber in members.by_ref().take(size) {
            subscriber.tags.insert(tag.clone());
            changes.set(&subscriber)?;
        }
        let segment = Segment {
            newsletter: Some(newsletter),
            ..Segment::new(db, &format!("{name} {share}% {letter}"))?
        }
        .with_tags([tag]);
        changes.set(&segment)?;
        created.push(segment);
    }
    db.apply(changes)?;
    tracing::info!(name, newsletter, eligible = total, drawn, "generated random split");
    Ok(created)
}
