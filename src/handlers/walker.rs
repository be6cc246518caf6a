//! Dispatch of decomposed parts to registered handlers
//!
//! A consume pass has three phases:
//! 1. every registered handler gets `__begin__` once
//! 2. parts are dispatched in order; `#part-handler` manifests register new
//!    handlers on the spot and begin them immediately
//! 3. every handler that got `__begin__` gets `__end__` once
//!
//! Failures are logged and collected; they never stop the pass.

use super::catalog::{HandlerCatalog, HandlerManifest};
use super::registry::{HandlerRegistry, Mark, RegisteredHandler};
use super::{PartCall, first_line_or_bytes};
use crate::state::Frequency;
use crate::userdata::{Part, types};
use crate::{Cloud, CloudInitError, util};
use std::path::Path;
use tokio::fs;
use tracing::{debug, info, warn};

/// Bytes of an unhandled payload shown in the warning
const UNHANDLED_PREVIEW: usize = 24;

/// Summary of a consume pass
#[derive(Debug, Default)]
pub struct WalkReport {
    /// Parts whose type had a handler when they were reached
    pub dispatched: usize,
    /// Parts dropped for lack of a handler
    pub unhandled: usize,
    /// Handlers added from `#part-handler` manifests
    pub added_handlers: usize,
    /// (handler or manifest file, error)
    pub failures: Vec<(String, CloudInitError)>,
}

/// Call a handler if its frequency allows it in this pass
///
/// Returns whether the handler was invoked.
async fn run_part(
    entry: &mut RegisteredHandler,
    cloud: &Cloud,
    content_type: &str,
    filename: Option<&str>,
    payload: &[u8],
    pass: Frequency,
) -> Result<bool, CloudInitError> {
    if !entry.info.runs_in(pass) {
        debug!(
            "Skipping handler {} ({:?}) in {} pass",
            entry.handler.name(),
            entry.info.frequency,
            pass
        );
        return Ok(false);
    }

    let call = PartCall {
        content_type,
        filename,
        payload,
        frequency: (entry.info.version >= 2).then_some(pass),
    };
    entry
        .handler
        .handle_part(cloud, call)
        .await
        .map(|_| true)
        .map_err(|e| CloudInitError::handler(entry.handler.name(), e.to_string()))
}

async fn call_lifecycle(
    registry: &mut HandlerRegistry,
    idx: usize,
    cloud: &Cloud,
    marker: &str,
    pass: Frequency,
    report: &mut WalkReport,
) {
    let Some(entry) = registry.get_mut(idx) else {
        return;
    };
    if let Err(e) = run_part(entry, cloud, marker, None, &[], pass).await {
        warn!("Handler {} failed on {}: {}", entry.handler.name(), marker, e);
        report.failures.push((entry.handler.name().to_string(), e));
    }
}

/// Persist a `#part-handler` manifest and register the handler it names
async fn add_embedded_handler(
    registry: &mut HandlerRegistry,
    catalog: &HandlerCatalog,
    cloud: &Cloud,
    part: &Part,
    count: usize,
    pass: Frequency,
    report: &mut WalkReport,
) -> Result<bool, CloudInitError> {
    let path = cloud
        .paths()
        .instance_handlers_dir(cloud.instance_id())
        .join(format!("part-handler-{:03}", count));
    util::write_file(&path, &part.payload, 0o600).await?;

    let manifest = HandlerManifest::parse(&part.payload)?;
    let Some(handler) = catalog.instantiate(&manifest) else {
        warn!(
            "Part handler {} names unknown implementation '{}', known: {:?}",
            path.display(),
            manifest.handler,
            catalog.names()
        );
        return Ok(false);
    };

    let idx = registry.register(handler);
    info!("Added handler {} from {}", manifest.handler, path.display());
    call_lifecycle(registry, idx, cloud, types::CONTENT_START, pass, report).await;
    if let Some(entry) = registry.get_mut(idx) {
        entry.marks.insert(Mark::Initialized);
    }
    Ok(true)
}

/// Run a full consume pass over decomposed parts
pub async fn consume_userdata(
    registry: &mut HandlerRegistry,
    catalog: &HandlerCatalog,
    cloud: &Cloud,
    parts: &[Part],
    pass: Frequency,
) -> WalkReport {
    let mut report = WalkReport::default();

    // Begin every distinct handler once
    for idx in registry.active() {
        let already = registry
            .get(idx)
            .is_some_and(|e| e.marks.contains(&Mark::Initialized));
        if already {
            continue;
        }
        call_lifecycle(registry, idx, cloud, types::CONTENT_START, pass, &mut report).await;
        if let Some(entry) = registry.get_mut(idx) {
            entry.marks.insert(Mark::Initialized);
        }
    }

    let mut handler_count = 0;
    for part in parts {
        if part.content_type == types::PART_HANDLER {
            match add_embedded_handler(registry, catalog, cloud, part, handler_count, pass, &mut report)
                .await
            {
                Ok(true) => {
                    report.added_handlers += 1;
                    handler_count += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed to add part handler from {}: {}", part.filename, e);
                    report.failures.push((part.filename.clone(), e));
                }
            }
            continue;
        }

        let Some(idx) = registry.lookup(&part.content_type) else {
            let preview = first_line_or_bytes(&part.payload, UNHANDLED_PREVIEW);
            if part.content_type == types::NOT_MULTIPART {
                warn!("Unhandled non-multipart ({}) userdata: '{}...'", part.content_type, preview);
            } else {
                warn!("Unhandled unknown content-type ({}) userdata: '{}...'", part.content_type, preview);
            }
            report.unhandled += 1;
            continue;
        };

        report.dispatched += 1;
        let Some(entry) = registry.get_mut(idx) else {
            continue;
        };
        if let Err(e) = run_part(
            entry,
            cloud,
            &part.content_type,
            Some(&part.filename),
            &part.payload,
            pass,
        )
        .await
        {
            warn!("Failed handling {} ({}): {}", part.filename, part.content_type, e);
            report.failures.push((entry.handler.name().to_string(), e));
        }
    }

    // End every handler that was begun, exactly once
    for idx in 0..registry.len() {
        let due = registry.get(idx).is_some_and(|e| {
            e.marks.contains(&Mark::Initialized) && !e.marks.contains(&Mark::Finalized)
        });
        if !due {
            continue;
        }
        if let Some(entry) = registry.get_mut(idx) {
            entry.marks.insert(Mark::Finalized);
        }
        call_lifecycle(registry, idx, cloud, types::CONTENT_END, pass, &mut report).await;
    }

    info!(
        "Consumed {} parts: {} dispatched, {} unhandled, {} failures",
        parts.len(),
        report.dispatched,
        report.unhandled,
        report.failures.len()
    );
    report
}

/// Register handlers from manifests persisted in a directory (sorted by name)
///
/// Unreadable or unknown manifests are logged and skipped. Returns the
/// number of handlers added.
pub async fn load_persisted_handlers(
    registry: &mut HandlerRegistry,
    catalog: &HandlerCatalog,
    dir: &Path,
) -> Result<usize, CloudInitError> {
    if !fs::try_exists(dir).await.unwrap_or(false) {
        return Ok(0);
    }

    let mut files = Vec::new();
    let mut read_dir = fs::read_dir(dir).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();

    let mut added = 0;
    for path in files {
        let manifest = match fs::read(&path)
            .await
            .map_err(CloudInitError::from)
            .and_then(|raw| HandlerManifest::parse(&raw))
        {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!("Failed to register handler from {}: {}", path.display(), e);
                continue;
            }
        };
        match catalog.instantiate(&manifest) {
            Some(handler) => {
                registry.register(handler);
                debug!("Added handler {} from {}", manifest.handler, path.display());
                added += 1;
            }
            None => warn!(
                "Could not find a valid handler named '{}' in {}",
                manifest.handler,
                path.display()
            ),
        }
    }
    Ok(added)
}
