//! Tar archive container for exported databases.
//!
//! Layout: one `schema.sql` entry holding the sanitized DDL plus one entry
//! per table file, named exactly as the file is named on disk. Archives are
//! gzip-compressed (`.tar.gz` / `.tgz`) or plain (`.tar`), chosen by the
//! file name.
//!
//! Writing goes to a hidden sibling file that is renamed into place once
//! complete, so a failed export never leaves a truncated archive under the
//! requested name.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, info, warn};

use crate::core::TableDescriptor;
use crate::error::{BackupError, Result};

/// Name of the schema entry.
pub const SCHEMA_ENTRY: &str = "schema.sql";

/// Container encoding, chosen by file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    Tar,
}

impl ArchiveFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Ok(ArchiveFormat::TarGz)
        } else if name.ends_with(".tar") {
            Ok(ArchiveFormat::Tar)
        } else {
            Err(BackupError::Archive(format!(
                "{} must end in .tar.gz, .tgz or .tar",
                path.display()
            )))
        }
    }
}

/// Table entries written to an archive, by table name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveManifest {
    pub path: PathBuf,
    pub tables: BTreeMap<String, Vec<String>>,
}

impl ArchiveManifest {
    pub fn entry_count(&self) -> usize {
        1 + self.tables.values().map(Vec::len).sum::<usize>()
    }
}

enum Sink {
    Gzip(GzEncoder<File>),
    Plain(File),
}

impl Sink {
    fn finish(self) -> io::Result<File> {
        match self {
            Sink::Gzip(encoder) => encoder.finish(),
            Sink::Plain(file) => Ok(file),
        }
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::Gzip(encoder) => encoder.write(buf),
            Sink::Plain(file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Gzip(encoder) => encoder.flush(),
            Sink::Plain(file) => file.flush(),
        }
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".to_string());
    path.with_file_name(format!(".{}.partial", name))
}

/// Write `schema` and every required file of `tables` from `source_dir`.
///
/// Blocking; run it off the async executor.
pub fn write_archive(
    path: &Path,
    compression_level: u32,
    schema: &str,
    source_dir: &Path,
    tables: &[TableDescriptor],
) -> Result<ArchiveManifest> {
    let format = ArchiveFormat::from_path(path)?;
    let temp_path = partial_path(path);

    let result = write_entries(&temp_path, format, compression_level, schema, source_dir, tables)
        .and_then(|tables| {
            std::fs::rename(&temp_path, path)?;
            Ok(tables)
        });

    match result {
        Ok(tables) => {
            let manifest = ArchiveManifest {
                path: path.to_path_buf(),
                tables,
            };
            info!(
                "Wrote archive {} ({} entries)",
                path.display(),
                manifest.entry_count()
            );
            Ok(manifest)
        }
        Err(e) => {
            if let Err(remove_err) = std::fs::remove_file(&temp_path) {
                if remove_err.kind() != io::ErrorKind::NotFound {
                    warn!(
                        "Could not remove partial archive {}: {}",
                        temp_path.display(),
                        remove_err
                    );
                }
            }
            Err(e)
        }
    }
}

fn write_entries(
    temp_path: &Path,
    format: ArchiveFormat,
    compression_level: u32,
    schema: &str,
    source_dir: &Path,
    tables: &[TableDescriptor],
) -> Result<BTreeMap<String, Vec<String>>> {
    let file = File::create(temp_path)?;
    let sink = match format {
        ArchiveFormat::TarGz => Sink::Gzip(GzEncoder::new(file, Compression::new(compression_level))),
        ArchiveFormat::Tar => Sink::Plain(file),
    };
    let mut builder = tar::Builder::new(sink);

    let mut header = tar::Header::new_gnu();
    header.set_size(schema.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
    header.set_cksum();
    builder.append_data(&mut header, SCHEMA_ENTRY, schema.as_bytes())?;

    let mut entries = BTreeMap::new();
    for table in tables {
        let mut names = Vec::new();
        for (extension, file_name) in table.required_files()? {
            let source = source_dir.join(&file_name);
            if !source.is_file() {
                return Err(BackupError::file_not_found(&table.name, extension, source_dir));
            }
            builder.append_path_with_name(&source, &file_name)?;
            debug!("Archived {}", file_name);
            names.push(file_name);
        }
        entries.insert(table.name.clone(), names);
    }

    let file = builder.into_inner()?.finish()?;
    file.sync_all()?;
    Ok(entries)
}

/// Read access to an existing archive.
#[derive(Debug, Clone)]
pub struct ArchiveReader {
    path: PathBuf,
    format: ArchiveFormat,
}

impl ArchiveReader {
    pub fn open(path: &Path) -> Result<Self> {
        let format = ArchiveFormat::from_path(path)?;
        if !path.is_file() {
            return Err(BackupError::Archive(format!(
                "archive {} does not exist",
                path.display()
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            format,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn archive(&self) -> Result<tar::Archive<Box<dyn Read>>> {
        let file = BufReader::new(File::open(&self.path)?);
        let reader: Box<dyn Read> = match self.format {
            ArchiveFormat::TarGz => Box::new(GzDecoder::new(file)),
            ArchiveFormat::Tar => Box::new(file),
        };
        Ok(tar::Archive::new(reader))
    }

    /// Read the schema entry without extracting anything.
    pub fn read_schema(&self) -> Result<String> {
        let mut archive = self.archive()?;
        for entry in archive.entries()? {
            let mut entry = entry?;
            if entry.path()?.to_string_lossy() == SCHEMA_ENTRY {
                let mut schema = String::new();
                entry.read_to_string(&mut schema)?;
                return Ok(schema);
            }
        }
        Err(BackupError::Archive(format!(
            "{} has no {} entry",
            self.path.display(),
            SCHEMA_ENTRY
        )))
    }

    /// Extract the files of `tables` into `dest`, ignoring every other entry.
    ///
    /// Existing files are overwritten in place, keeping their inode, so a
    /// server holding them open under `LOCK TABLES` reads the new contents.
    /// Returns the paths written. A table file missing from the archive is a
    /// `FileNotFound` naming the archive.
    pub fn extract_tables(&self, tables: &[TableDescriptor], dest: &Path) -> Result<Vec<PathBuf>> {
        let mut wanted: HashMap<String, (String, &'static str)> = HashMap::new();
        for table in tables {
            for (extension, file_name) in table.required_files()? {
                wanted.insert(file_name, (table.name.clone(), extension));
            }
        }

        let mut written = Vec::new();
        let mut archive = self.archive()?;
        for entry in archive.entries()? {
            if wanted.is_empty() {
                break;
            }
            let mut entry = entry?;
            let name = entry.path()?.to_string_lossy().into_owned();
            if wanted.remove(&name).is_some() {
                let target = dest.join(&name);
                let mut file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&target)?;
                io::copy(&mut entry, &mut file)?;
                debug!("Extracted {}", name);
                written.push(target);
            }
        }

        if let Some((table, extension)) = wanted.into_values().next() {
            return Err(BackupError::file_not_found(table, extension, &self.path));
        }
        info!(
            "Extracted {} files from {} into {}",
            written.len(),
            self.path.display(),
            dest.display()
        );
        Ok(written)
    }
}
