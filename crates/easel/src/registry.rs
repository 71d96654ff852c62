//! Ordered collection of tracked outputs.
//!
//! Keyed by output id, kept in insertion order for stable display. Replacing
//! an output keeps its position; removal shifts later outputs down.

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::output::{Output, PlacementUpdate};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputRegistry {
    outputs: IndexMap<String, Output>,
}

impl OutputRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Output> {
        self.outputs.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.outputs.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Output> {
        self.outputs.values()
    }

    /// Owned copy of every output, in display order.
    pub fn snapshot(&self) -> Vec<Output> {
        self.outputs.values().cloned().collect()
    }

    /// Append an output. An existing output with the same id is replaced in place.
    pub fn insert(&mut self, output: Output) -> Option<Output> {
        self.outputs.insert(output.id.clone(), output)
    }

    /// Remove every output whose id is listed. Unknown ids are ignored.
    pub fn remove<I, S>(&mut self, ids: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut removed = 0;
        for id in ids {
            if self.outputs.shift_remove(id.as_ref()).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Drop outputs without a usable remote job id. Returns how many were dropped.
    pub fn cleanup(&mut self) -> usize {
        let before = self.outputs.len();
        self.outputs
            .retain(|_, output| output.remote_job_id().is_some());
        before - self.outputs.len()
    }

    /// Outputs still waiting on the remote service.
    ///
    /// Computed on every call.
    pub fn incomplete(&self) -> Vec<&Output> {
        self.outputs
            .values()
            .filter(|output| output.is_trackable())
            .collect()
    }

    /// Distinct remote job ids of incomplete outputs, in first-seen order.
    pub fn incomplete_remote_ids(&self) -> Vec<String> {
        self.outputs
            .values()
            .filter(|output| !output.is_terminal())
            .filter_map(|output| output.remote_job_id())
            .collect::<IndexSet<_>>()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Every output polling the given remote job.
    pub fn for_remote_job_mut<'a>(
        &'a mut self,
        remote_job_id: &'a str,
    ) -> impl Iterator<Item = &'a mut Output> + 'a {
        self.outputs
            .values_mut()
            .filter(move |output| output.remote_job_id() == Some(remote_job_id))
    }

    pub fn update_placement(&mut self, id: &str, update: PlacementUpdate) -> bool {
        match self.outputs.get_mut(id) {
            Some(output) => {
                update.apply(&mut output.placement);
                true
            }
            None => false,
        }
    }
}

impl Serialize for OutputRegistry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.outputs.values())
    }
}

impl<'de> Deserialize<'de> for OutputRegistry {
    /// Persisted as a plain array. Entries that do not decode and later
    /// entries reusing an id are dropped.
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let list = Vec::<serde_json::Value>::deserialize(deserializer)?;
        let mut outputs = IndexMap::with_capacity(list.len());
        for entry in list {
            let id = entry.get("id").cloned();
            let output = match serde_json::from_value::<Output>(entry) {
                Ok(output) => output,
                Err(e) => {
                    tracing::warn!(id = ?id, error = %e, "Dropping unreadable persisted output");
                    continue;
                }
            };
            if outputs.contains_key(&output.id) {
                tracing::warn!(id = %output.id, "Dropping persisted output with duplicate id");
                continue;
            }
            outputs.insert(output.id.clone(), output);
        }
        Ok(Self { outputs })
    }
}

impl FromIterator<Output> for OutputRegistry {
    fn from_iter<T: IntoIterator<Item = Output>>(iter: T) -> Self {
        let mut registry = Self::new();
        for output in iter {
            registry.insert(output);
        }
        registry
    }
}
