//! Bundling processed documents into a single zip archive.
//!
//! Bundling runs once per session, after every document worker has finished.
//! The archive is written to a temporary file next to its final location and
//! renamed into place only once it is complete, so a failure part-way
//! through (a full disk, say) leaves the previous archive, if any, untouched.
//!
//! The archive holds exactly the entries it was written with. Anything an
//! earlier run left at the same path is replaced, or removed when there is
//! nothing to bundle.

use std::{
    collections::HashSet,
    fs::{self, File},
    io::{self, BufWriter},
};

use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

use crate::prelude::*;

/// One processed document to add to an archive.
#[derive(Clone, Debug)]
pub struct BundleEntry {
    /// The name to use inside the archive: the original document name.
    pub name: String,

    /// The processed document. Deleted once the archive is written.
    pub path: PathBuf,
}

/// Write `entries` into a fresh archive at `archive_path`, replacing any
/// archive already there, then delete each entry's file.
///
/// Returns the names of the documents in the archive. If `entries` is empty,
/// any existing archive is deleted and this returns `None`.
///
/// This does blocking I/O. Call it via
/// [`crate::async_utils::spawn_blocking_propagating_panics`].
#[instrument(level = "debug", skip_all, fields(archive = %archive_path.display(), new_entries = entries.len()))]
pub fn write_bundle(archive_path: &Path, entries: &[BundleEntry]) -> Result<Option<Vec<String>>> {
    if entries.is_empty() {
        match fs::remove_file(archive_path) {
            Ok(()) => debug!("removed stale archive"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to remove stale archive {:?}", archive_path.display())
                });
            }
        }
        debug!("nothing to bundle");
        return Ok(None);
    }
    let new_names = unique_names(entries);

    let parent = archive_path
        .parent()
        .context("archive path has no parent directory")?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".bundle-")
        .suffix(".zip.tmp")
        .tempfile_in(parent)
        .with_context(|| format!("failed to create temporary archive in {:?}", parent.display()))?;

    let mut names = vec![];
    {
        let mut zip = ZipWriter::new(BufWriter::new(tmp.as_file_mut()));

        let options =
            SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        for (entry, name) in entries.iter().zip(&new_names) {
            zip.start_file(name.as_str(), options)
                .with_context(|| format!("failed to start archive entry {:?}", name))?;
            let mut input = File::open(&entry.path).with_context(|| {
                format!("failed to open processed document {:?}", entry.path.display())
            })?;
            io::copy(&mut input, &mut zip)
                .with_context(|| format!("failed to write {:?} to archive", name))?;
            names.push(name.clone());
        }

        let mut writer = zip.finish().context("failed to finish archive")?;
        io::Write::flush(&mut writer).context("failed to flush archive")?;
    }
    tmp.as_file()
        .sync_all()
        .context("failed to sync archive to disk")?;
    tmp.persist(archive_path).with_context(|| {
        format!("failed to move archive into place at {:?}", archive_path.display())
    })?;

    // Only now is it safe to delete the standalone documents.
    for entry in entries {
        if let Err(err) = fs::remove_file(&entry.path) {
            warn!(
                path = %entry.path.display(),
                "failed to delete bundled document: {}",
                err
            );
        }
    }

    info!(documents = names.len(), "wrote bundle");
    Ok(Some(names))
}

/// Pick a unique archive name for each entry, appending " (2)", " (3)", ...
/// before the extension when two documents share a name.
fn unique_names(entries: &[BundleEntry]) -> Vec<String> {
    let mut used = HashSet::new();
    entries
        .iter()
        .map(|entry| {
            let mut candidate = entry.name.clone();
            let mut n = 2;
            while used.contains(&candidate) {
                candidate = with_suffix(&entry.name, n);
                n += 1;
            }
            used.insert(candidate.clone());
            candidate
        })
        .collect()
}

/// `report.pdf` + 2 becomes `report (2).pdf`.
fn with_suffix(name: &str, n: usize) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem} ({n}).{ext}"),
        _ => format!("{name} ({n})"),
    }
}
