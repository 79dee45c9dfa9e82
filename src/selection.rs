use std::collections::{BTreeMap, BTreeSet};

use crate::error::{InputError, NotFound};
use crate::topology::{PartitionId, TopologySnapshot};

/// Partitions chosen by the operator, keyed by topic name.
///
/// Iteration is ordered by topic name and then partition id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionSelection {
    topics: BTreeMap<String, BTreeSet<PartitionId>>,
}

impl PartitionSelection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(
        &mut self,
        topic: impl Into<String>,
        partitions: impl IntoIterator<Item = PartitionId>,
    ) {
        let selected = self.topics.entry(topic.into()).or_default();
        selected.extend(partitions);
        if selected.is_empty() {
            // an empty selection for a topic is no selection at all
            self.topics.retain(|_, p| !p.is_empty());
        }
    }

    /// Select every partition of `topic` in `snapshot`.
    pub fn select_all(&mut self, topic: &str, snapshot: &TopologySnapshot) -> Result<(), NotFound> {
        let partitions = snapshot.topic(topic)?.partitions.keys().copied();
        self.select(topic, partitions);
        Ok(())
    }

    pub fn deselect(&mut self, topic: &str, partition: PartitionId) {
        if let Some(selected) = self.topics.get_mut(topic) {
            selected.remove(&partition);
            if selected.is_empty() {
                self.topics.remove(topic);
            }
        }
    }

    pub fn deselect_topic(&mut self, topic: &str) {
        self.topics.remove(topic);
    }

    pub fn clear(&mut self) {
        self.topics.clear();
    }

    pub fn contains(&self, topic: &str, partition: PartitionId) -> bool {
        self.topics
            .get(topic)
            .map(|p| p.contains(&partition))
            .unwrap_or(false)
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.topics.keys().map(String::as_str)
    }

    pub fn partitions(&self, topic: &str) -> Option<&BTreeSet<PartitionId>> {
        self.topics.get(topic)
    }

    /// All selected `(topic, partition)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, PartitionId)> {
        self.topics
            .iter()
            .flat_map(|(topic, partitions)| partitions.iter().map(move |p| (topic.as_str(), *p)))
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Total number of selected partitions.
    pub fn len(&self) -> usize {
        self.topics.values().map(BTreeSet::len).sum()
    }

    /// Check that the selection is non-empty and only names partitions present in `snapshot`.
    pub fn validate(&self, snapshot: &TopologySnapshot) -> Result<(), InputError> {
        if self.is_empty() {
            return Err(InputError::EmptySelection);
        }

        for (topic, partition) in self.iter() {
            snapshot.partition(topic, partition)?;
        }

        Ok(())
    }
}

impl<S> FromIterator<(S, PartitionId)> for PartitionSelection
where
    S: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (S, PartitionId)>>(iter: I) -> Self {
        let mut selection = Self::new();
        for (topic, partition) in iter {
            selection.select(topic, [partition]);
        }
        selection
    }
}
