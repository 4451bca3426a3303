use std::collections::BTreeSet;

use crate::{
    Error, ReplicaId, ReplicationMetadata, Result, RowKey, TableRow, Version,
    metadata::user_columns, read::HeadRows, write::Replicator,
};

/// A replica whose copy of a row contradicts the replication
/// invariants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvariantViolation {
    pub key: RowKey,
    pub replica: ReplicaId,
    pub reason: String,
}

fn version_of(row: &TableRow) -> Result<Version> {
    Ok(ReplicationMetadata::read(&row.key, &row.properties)?
        .map_or(Version(0), |meta| meta.version))
}

impl Replicator {
    /// Compares every replica's copy of every row with the head's.
    ///
    /// Only meaningful while no writes or repairs are in flight. Checks
    /// that versions never increase down the chain, that any replica the
    /// head's bitmap names holds exactly the head's state, and that no
    /// replica holds a row the head lacks.
    pub(crate) fn check_replica_invariants(&self) -> Result<Vec<InvariantViolation>> {
        let view = self.views.refresh()?;
        let mut violations = vec![];
        let mut head_keys = BTreeSet::new();

        let mut violation = |key: &RowKey, replica: &ReplicaId, reason: String| {
            log::warn!("invariant violated for {} on {}: {}", key, replica, reason);
            violations.push(InvariantViolation {
                key: key.clone(),
                replica: replica.clone(),
                reason,
            });
        };

        for next in HeadRows::new(self, None) {
            let (_, head_row) = next?;
            head_keys.insert(head_row.key.clone());

            let key = &head_row.key;
            let head_meta = ReplicationMetadata::read(key, &head_row.properties)?;
            let head_version = head_meta.map_or(Version(0), |meta| meta.version);
            let mut predecessor = head_version;

            for replica in view.tails() {
                let copy = replica
                    .store
                    .get(key)
                    .map_err(|_| Error::ReplicaUnreachable(replica.id().clone()))?;
                let copy_version = match &copy {
                    Some(row) => version_of(row)?,
                    None => Version(0),
                };

                if copy_version > predecessor {
                    violation(
                        key,
                        replica.id(),
                        format!(
                            "holds {} while its predecessor holds {}",
                            copy_version, predecessor
                        ),
                    );
                }
                predecessor = copy_version;

                let Some(head_meta) = head_meta else { continue };
                if head_meta.view_id != view.id()
                    || !head_meta.commit_bitmap.contains(replica.position)
                {
                    continue;
                }

                match &copy {
                    None => violation(
                        key,
                        replica.id(),
                        "acknowledged by the head's bitmap but absent".to_string(),
                    ),
                    Some(row) => {
                        let copy_meta = ReplicationMetadata::read(key, &row.properties)?;
                        let same_state = copy_meta.is_some_and(|m| {
                            m.version == head_meta.version
                                && m.tombstone == head_meta.tombstone
                        }) && user_columns(&row.properties)
                            == user_columns(&head_row.properties);
                        if !same_state {
                            violation(
                                key,
                                replica.id(),
                                format!(
                                    "acknowledged {} but holds {:?}",
                                    head_meta.version,
                                    copy_meta.map(|m| (m.version, m.tombstone))
                                ),
                            );
                        }
                    }
                }
            }
        }

        for replica in view.tails() {
            let mut after: Option<RowKey> = None;
            loop {
                let page = replica
                    .store
                    .query(None, after.as_ref(), self.config.query_page_size)
                    .map_err(|_| Error::ReplicaUnreachable(replica.id().clone()))?;

                for row in &page.rows {
                    if !head_keys.contains(&row.key) {
                        violation(
                            &row.key,
                            replica.id(),
                            "holds a row the head does not".to_string(),
                        );
                    }
                }

                match page.continuation {
                    Some(next) => after = Some(next),
                    None => break,
                }
            }
        }

        Ok(violations)
    }
}
