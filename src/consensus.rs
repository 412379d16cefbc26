//! Quorum decisions over per-blobber responses. Nothing here retries; the
//! orchestrators decide what to do with a verdict.

use std::collections::BTreeMap;

use tracing::debug;

use crate::{
    blobber::FileMeta,
    error::{Error, ErrorKind, Result},
};

pub fn write_quorum(data_shards: usize, parity_shards: usize) -> usize {
    data_shards + parity_shards.div_ceil(2)
}

pub fn read_quorum(data_shards: usize) -> usize {
    data_shards
}

/// Blobbers that agreed on a root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteVerdict {
    pub root: String,
    pub agreeing: Vec<usize>,
}

/// Kinds that mean a blobber answered but said no, as opposed to not
/// answering at all.
fn is_answer(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::WriteMarkerValidationFailed | ErrorKind::Conflict | ErrorKind::ConsensusFailed
    )
}

fn summarize(results: &[(usize, Result<String>)]) -> String {
    results
        .iter()
        .filter_map(|(i, r)| r.as_ref().err().map(|e| format!("blobber {}: {}", i, e)))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Error shared by at least `threshold` blobbers that no retry can fix,
/// e.g. every blobber rejecting the client's signature.
fn dominant_fatal<T>(results: &[(usize, Result<T>)], threshold: usize) -> Option<Error> {
    let mut counts: BTreeMap<&'static str, (usize, &Error)> = BTreeMap::new();
    for (_, result) in results {
        if let Err(e) = result {
            if e.is_retryable() || is_answer(e.kind()) || e.kind() == ErrorKind::FileNotFound {
                continue;
            }
            let entry = counts.entry(e.kind().as_code()).or_insert((0, e));
            entry.0 += 1;
        }
    }
    counts
        .into_values()
        .filter(|(n, _)| *n >= threshold)
        .max_by_key(|(n, _)| *n)
        .map(|(_, e)| Error::new(e.kind(), e.message().to_string()))
}

/// Write-path verdict: success iff at least `quorum` blobbers report the
/// same root.
pub fn write_consensus(results: &[(usize, Result<String>)], quorum: usize) -> Result<WriteVerdict> {
    let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, result) in results {
        if let Ok(root) = result {
            groups.entry(root.as_str()).or_default().push(*i);
        }
    }
    let best = groups
        .iter()
        .max_by(|a, b| a.1.len().cmp(&b.1.len()).then(b.1[0].cmp(&a.1[0])));
    if let Some((root, agreeing)) = best {
        if agreeing.len() >= quorum {
            return Ok(WriteVerdict {
                root: root.to_string(),
                agreeing: agreeing.clone(),
            });
        }
    }
    let answered = results
        .iter()
        .filter(|(_, r)| match r {
            Ok(_) => true,
            Err(e) => is_answer(e.kind()),
        })
        .count();
    debug!(
        "Write consensus failed: {} groups, {} answered, quorum {}",
        groups.len(),
        answered,
        quorum
    );
    if answered >= quorum {
        return Err(Error::consensus_failed(format!(
            "{} blobbers answered but no {} agree: {}",
            answered,
            quorum,
            summarize(results)
        )));
    }
    if let Some(fatal) = dominant_fatal(results, results.len() + 1 - quorum.min(results.len())) {
        return Err(fatal);
    }
    Err(Error::consensus_not_reached(format!(
        "{} of {} required blobbers answered: {}",
        answered,
        quorum,
        summarize(results)
    )))
}

/// Verdict over plain acknowledgements, where every blobber answers with
/// its own value: success iff at least `quorum` acknowledged.
pub fn ack_consensus<T>(results: &[(usize, Result<T>)], quorum: usize) -> Result<Vec<usize>> {
    let acks: Vec<(usize, Result<String>)> = results
        .iter()
        .map(|(i, r)| (*i, r.as_ref().map(|_| "ack".to_string()).map_err(Clone::clone)))
        .collect();
    write_consensus(&acks, quorum).map(|verdict| verdict.agreeing)
}

/// Read-path verdict over the number of shards that verified.
pub fn read_consensus(verified: usize, data_shards: usize) -> Result<()> {
    if verified < read_quorum(data_shards) {
        return Err(Error::consensus_not_reached(format!(
            "{} shards verified, {} required",
            verified,
            read_quorum(data_shards)
        )));
    }
    Ok(())
}

/// Majority vote over arbitrary records by digest. Ties prefer the record
/// with the larger `updated_at`, then the lowest blobber index.
fn vote<T: Clone>(
    results: &[(usize, Result<T>)],
    data_shards: usize,
    digest: impl Fn(&T) -> String,
    updated_at: impl Fn(&T) -> i64,
) -> Result<(T, Vec<usize>)> {
    let mut groups: BTreeMap<String, (Vec<usize>, &T)> = BTreeMap::new();
    for (i, result) in results {
        if let Ok(value) = result {
            groups.entry(digest(value)).or_insert((vec![], value)).0.push(*i);
        }
    }
    let ok_total: usize = groups.values().map(|(v, _)| v.len()).sum();
    let best = groups.values().max_by(|a, b| {
        a.0.len()
            .cmp(&b.0.len())
            .then(updated_at(a.1).cmp(&updated_at(b.1)))
            .then(b.0[0].cmp(&a.0[0]))
    });
    let not_found = results
        .iter()
        .filter(|(_, r)| matches!(r, Err(e) if e.kind() == ErrorKind::FileNotFound))
        .count();
    let quorum = read_quorum(data_shards);
    match best {
        Some((indices, value)) if indices.len() >= quorum => Ok(((*value).clone(), indices.clone())),
        _ if not_found >= quorum => Err(Error::new(
            ErrorKind::FileNotFound,
            format!("{} blobbers report the object missing", not_found),
        )),
        Some((indices, value)) if ok_total >= quorum => Ok(((*value).clone(), indices.clone())),
        _ => {
            if let Some(fatal) = dominant_fatal(results, quorum) {
                return Err(fatal);
            }
            Err(Error::consensus_not_reached(format!(
                "{} of {} required blobbers answered",
                ok_total, quorum
            )))
        }
    }
}

pub fn meta_consensus(
    results: &[(usize, Result<FileMeta>)],
    data_shards: usize,
) -> Result<(FileMeta, Vec<usize>)> {
    vote(results, data_shards, FileMeta::meta_hash, |m| m.updated_at)
}

pub fn list_consensus(
    results: &[(usize, Result<Vec<FileMeta>>)],
    data_shards: usize,
) -> Result<(Vec<FileMeta>, Vec<usize>)> {
    vote(
        results,
        data_shards,
        |children| {
            children
                .iter()
                .map(FileMeta::meta_hash)
                .collect::<Vec<_>>()
                .join(",")
        },
        |children| children.iter().map(|c| c.updated_at).max().unwrap_or(0),
    )
}
