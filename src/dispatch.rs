//! Realizing a content graph into the local store.
//!
//! The graph below a root descriptor is walked with an explicit worklist.  A
//! digest-keyed `seen` set makes sure each node is visited once per pull, and
//! nodes already in the [`ContentStore`] are not fetched again.  Stored
//! manifests and indexes are still parsed so that missing children get
//! picked up.

use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
};

use anyhow::{anyhow, Context};
use log::{debug, trace};
use tokio::{sync::Semaphore, task::JoinSet};

use crate::{
    content::ContentStore,
    error::{Error, Result},
    manifest::{self, ContentDescriptor, Platform},
    remote::Fetcher,
};

/// Counters describing the work done by one pull.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchStats {
    /// Nodes fetched from the remote.
    pub fetched: usize,
    /// Nodes already present locally.
    pub skipped: usize,
    /// Bytes fetched from the remote.
    pub bytes: u64,
}

struct Visit {
    fetched: Option<u64>,
    children: Vec<ContentDescriptor>,
}

async fn visit<F: Fetcher>(
    content: Arc<ContentStore>,
    fetcher: Arc<F>,
    semaphore: Arc<Semaphore>,
    platform: Arc<Platform>,
    desc: ContentDescriptor,
) -> Result<Visit> {
    let kind = desc.kind()?;

    if content.has(&desc.digest) {
        trace!("already have {}", desc.digest);
        let children = if kind.has_children() {
            let data = content.get_async(desc.digest.clone()).await?;
            manifest::children(&desc, kind, &data, &platform)?
        } else {
            vec![]
        };
        return Ok(Visit {
            fetched: None,
            children,
        });
    }

    debug!("fetching {} ({})", desc.digest, desc.media_type);
    let data = {
        let _permit = semaphore.acquire().await.context("Fetch semaphore closed")?;
        fetcher.fetch(&desc).await.map_err(|err| Error::Fetch {
            digest: desc.digest.clone(),
            source: err.into(),
        })?
    };

    desc.digest.verify(&data)?;
    if data.len() as u64 != desc.size {
        return Err(Error::Malformed {
            digest: desc.digest.clone(),
            source: anyhow!(
                "content is {} bytes but its descriptor says {}",
                data.len(),
                desc.size
            )
            .into(),
        });
    }

    let children = manifest::children(&desc, kind, &data, &platform)?;
    let size = data.len() as u64;
    content.put_async(desc.digest, data).await?;

    Ok(Visit {
        fetched: Some(size),
        children,
    })
}

/// Fetch everything reachable from `root` that the store lacks.
///
/// Siblings are fetched in parallel, at most `max_concurrent` at a time.  The
/// first failure aborts the walk; blobs stored before it are kept.
pub async fn fetch_graph<F: Fetcher + 'static>(
    content: &Arc<ContentStore>,
    fetcher: Arc<F>,
    root: ContentDescriptor,
    platform: &Platform,
    max_concurrent: usize,
) -> Result<FetchStats> {
    let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let platform = Arc::new(platform.clone());
    let mut stats = FetchStats::default();

    let mut seen = HashSet::from([root.digest.clone()]);
    let mut queue = VecDeque::from([root]);
    let mut tasks = JoinSet::new();

    loop {
        while let Some(desc) = queue.pop_front() {
            tasks.spawn(visit(
                Arc::clone(content),
                Arc::clone(&fetcher),
                Arc::clone(&semaphore),
                Arc::clone(&platform),
                desc,
            ));
        }

        // dropping the set on error aborts the remaining fetches
        let Some(joined) = tasks.join_next().await else {
            break;
        };
        let visit = joined.context("Joining fetch task")??;

        match visit.fetched {
            Some(bytes) => {
                stats.fetched += 1;
                stats.bytes += bytes;
            }
            None => stats.skipped += 1,
        }
        for child in visit.children {
            if seen.insert(child.digest.clone()) {
                queue.push_back(child);
            }
        }
    }

    debug!(
        "fetched {} nodes ({} bytes), {} already present",
        stats.fetched, stats.bytes, stats.skipped
    );
    Ok(stats)
}
