use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::Read;

use crate::downloader::to_csv;
use crate::error::{FlashError, Result};
use crate::loader::from_delimited;
use crate::projects::ProjectMeta;
use crate::table::Registry;

/// Archive entry holding the snippet source.
pub const SNIPPET_ENTRY: &str = "snippet.rhai";
/// Archive entry holding the project metadata as JSON.
pub const META_ENTRY: &str = "meta.json";
/// Directory prefix for one CSV per dataset, named after the original file.
pub const DATA_PREFIX: &str = "data/";

/// Contents of a project archive after reading it back.
#[derive(Debug)]
pub struct ProjectArchive {
    pub snippet: String,
    pub meta: Option<ProjectMeta>,
    pub registry: Registry,
}

/// Pack a project into a gzip-compressed tar archive
///
/// Entries are written in a fixed order: the snippet, the metadata, then
/// every dataset as CSV in registry order.
///
/// # Arguments
/// * `meta` - Metadata stored alongside the data
/// * `snippet` - Snippet source, stored byte for byte
/// * `registry` - Datasets to store
///
/// # Returns
/// * `Result<Vec<u8>>` - The archive bytes
pub fn save_project(meta: &ProjectMeta, snippet: &str, registry: &Registry) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    append(&mut builder, SNIPPET_ENTRY, snippet.as_bytes())?;
    append(&mut builder, META_ENTRY, &serde_json::to_vec_pretty(meta)?)?;
    for dataset in registry.iter() {
        let path = format!("{}{}", DATA_PREFIX, dataset.name);
        append(&mut builder, &path, to_csv(&dataset.table).as_bytes())?;
    }

    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

/// Read a project archive produced by `save_project`
///
/// Datasets come back in archive order. A missing snippet entry yields an
/// empty snippet; a missing or unreadable metadata entry yields `None`.
///
/// # Arguments
/// * `bytes` - Archive bytes
///
/// # Returns
/// * `Result<ProjectArchive>` - Snippet, metadata and datasets, or an archive error
pub fn load_project(bytes: &[u8]) -> Result<ProjectArchive> {
    let decoder = GzDecoder::new(bytes);
    let mut archive = tar::Archive::new(decoder);

    let mut snippet = String::new();
    let mut meta = None;
    let mut registry = Registry::new();

    let entries = archive
        .entries()
        .map_err(|e| FlashError::Archive(e.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| FlashError::Archive(e.to_string()))?;
        let path = entry
            .path()
            .map_err(|e| FlashError::Archive(e.to_string()))?
            .to_string_lossy()
            .into_owned();

        let mut content = Vec::new();
        entry
            .read_to_end(&mut content)
            .map_err(|e| FlashError::Archive(format!("{}: {}", path, e)))?;

        if path == SNIPPET_ENTRY {
            snippet = String::from_utf8(content)
                .map_err(|_| FlashError::Archive("snippet is not valid UTF-8".to_string()))?;
        } else if path == META_ENTRY {
            meta = serde_json::from_slice(&content).ok();
        } else if let Some(name) = path.strip_prefix(DATA_PREFIX) {
            if name.is_empty() {
                continue;
            }
            let table = from_delimited(&content)
                .map_err(|e| FlashError::Archive(format!("{}: {}", path, e)))?;
            registry.insert(name, table);
        }
    }

    Ok(ProjectArchive {
        snippet,
        meta,
        registry,
    })
}

fn append<W: std::io::Write>(builder: &mut tar::Builder<W>, path: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    builder
        .append_data(&mut header, path, data)
        .map_err(|e| FlashError::Archive(format!("{}: {}", path, e)))
}
