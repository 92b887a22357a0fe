impl FileStore {
    /// Resolves who holds `path`. With fewer than two live claimants they take
    /// the desired path and any conflict record goes away. Otherwise exactly
    /// one conflict record exists and every claimant gets a stable counter
    /// suffix. Returns folders whose local path moved.
    fn check_conflicts(&mut self, path: &str) -> Vec<String> {
        let conflict_id = conflict_record_id(path);
        let mut members: Vec<(String, bool, Option<u32>, u64)> = self
            .records
            .values()
            .filter(|record| record.is_live() && record.desired_local_path == path)
            .map(|record| {
                let seated = record.conflict_id.as_deref() == Some(conflict_id.as_str())
                    && record.counter.is_some();
                (record.id.clone(), seated, record.counter, record.seq)
            })
            .collect();
        // Seated members keep their counter order, newcomers follow in
        // first-observation order.
        members.sort_by_key(|(_, seated, counter, seq)| {
            (!*seated, if *seated { *counter } else { None }, *seq)
        });

        let mut relocated = Vec::new();
        if members.len() < 2 {
            if self.records.remove(&conflict_id).is_some() {
                tracing::debug!(path, "conflict resolved");
            }
            for (id, ..) in members {
                if let Some(record) = self.records.get_mut(&id) {
                    record.conflict_id = None;
                    record.counter = None;
                }
                if self.assign_local_path(&id, path.to_string()) {
                    relocated.push(id);
                }
            }
            return relocated;
        }

        if !self.records.contains_key(&conflict_id) {
            let seq = self.bump_seq();
            let record = FileRecord::synthetic(
                conflict_id.clone(),
                CONFLICT_MIME,
                path.rsplit('/').next().unwrap_or(path).to_string(),
                path.to_string(),
                seq,
            );
            self.records.insert(conflict_id.clone(), record);
            tracing::debug!(path, claimants = members.len(), "conflict detected");
        }
        let mut next = self
            .records
            .get(&conflict_id)
            .and_then(|conflict| conflict.counter)
            .unwrap_or(0);

        let mut conflicting = Vec::with_capacity(members.len());
        for (id, seated, counter, _) in members {
            let counter = match counter {
                Some(counter) if seated => counter,
                _ => {
                    next += 1;
                    next
                }
            };
            if let Some(record) = self.records.get_mut(&id) {
                record.conflict_id = Some(conflict_id.clone());
                record.counter = Some(counter);
            }
            if self.assign_local_path(&id, with_counter_suffix(path, counter)) {
                relocated.push(id.clone());
            }
            conflicting.push(id);
        }

        if let Some(conflict) = self.records.get_mut(&conflict_id) {
            conflict.counter = Some(next);
            if conflict.conflicting != conflicting {
                conflict.conflicting = conflicting;
                conflict.dirty = true;
            }
        }
        relocated
    }

    /// Returns true when a folder's local path changed.
    fn assign_local_path(&mut self, id: &str, local_path: String) -> bool {
        let Some(record) = self.records.get_mut(id) else {
            return false;
        };
        if record.local_path == local_path {
            return false;
        }
        record.local_path = local_path;
        if record.is_folder() {
            return true;
        }
        record.dirty = true;
        false
    }

    /// Drops redirects whose local path is held by a real or conflict record.
    fn drop_shadowed_redirects(&mut self) {
        let held: HashSet<String> = self
            .records
            .values()
            .filter(|record| !record.is_redirect())
            .map(|record| record.local_path.clone())
            .collect();
        self.records
            .retain(|_, record| !(record.is_redirect() && held.contains(&record.local_path)));
    }

    /// Deletes redirects whose target no longer exists, repeating until a
    /// pass removes nothing. Returns how many were deleted.
    pub fn collect_redirects(&mut self) -> usize {
        let mut collected = 0;
        loop {
            let dangling: Vec<String> = self
                .records
                .values()
                .filter(|record| {
                    record.is_redirect()
                        && record
                            .redirect_to
                            .as_ref()
                            .is_none_or(|target| !self.records.contains_key(target))
                })
                .map(|record| record.id.clone())
                .collect();
            if dangling.is_empty() {
                break;
            }
            collected += dangling.len();
            for id in dangling {
                self.records.remove(&id);
            }
        }
        if collected > 0 {
            self.needs_flush = true;
        }
        collected
    }
}
