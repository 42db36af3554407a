use std::collections::{HashMap, HashSet};

/// Two-way index between labels (tags or versions) and keys
#[derive(Debug, Default)]
pub(crate) struct TagIndex {
    by_label: HashMap<String, HashSet<String>>,
    by_key: HashMap<String, HashSet<String>>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the labels of `key`
    pub fn assign<I, S>(&mut self, key: &str, labels: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.remove_key(key);

        let labels: HashSet<String> = labels
            .into_iter()
            .map(|l| l.as_ref().to_string())
            .collect();
        if labels.is_empty() {
            return;
        }

        for label in &labels {
            self.by_label
                .entry(label.clone())
                .or_default()
                .insert(key.to_string());
        }
        self.by_key.insert(key.to_string(), labels);
    }

    pub fn remove_key(&mut self, key: &str) {
        let Some(labels) = self.by_key.remove(key) else {
            return;
        };
        for label in labels {
            if let Some(keys) = self.by_label.get_mut(&label) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_label.remove(&label);
                }
            }
        }
    }

    /// Remove `label` and return the keys it covered
    pub fn take(&mut self, label: &str) -> Vec<String> {
        let Some(keys) = self.by_label.remove(label) else {
            return Vec::new();
        };
        for key in &keys {
            if let Some(labels) = self.by_key.get_mut(key) {
                labels.remove(label);
                if labels.is_empty() {
                    self.by_key.remove(key);
                }
            }
        }
        keys.into_iter().collect()
    }

    pub fn labels_for(&self, key: &str) -> Vec<String> {
        self.by_key
            .get(key)
            .map(|labels| labels.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop every key for which `keep` returns false
    pub fn retain_keys<F>(&mut self, keep: F)
    where
        F: Fn(&str) -> bool,
    {
        let stale: Vec<String> = self
            .by_key
            .keys()
            .filter(|k| !keep(k))
            .cloned()
            .collect();
        for key in stale {
            self.remove_key(&key);
        }
    }

    pub fn clear(&mut self) {
        self.by_label.clear();
        self.by_key.clear();
    }

    pub fn key_count(&self) -> usize {
        self.by_key.len()
    }
}
